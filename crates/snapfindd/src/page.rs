//! Server-rendered HTML pages.

use crate::flow::{BatchReport, ItemOutcome, UploadBatch};
use snapfind_core::Device;
use snapfind_store::StoredImage;
use std::fmt::Write;

const TITLE: &str = "Photo Semantic Finder";
const GRID_COLUMNS: usize = 4;

const STYLE: &str = r#"
body { font-family: system-ui, sans-serif; margin: 0; display: flex; min-height: 100vh; }
aside { width: 240px; padding: 1rem; background: #f3f4f6; }
main { flex: 1; padding: 1rem 2rem; }
h6 { text-decoration: underline; font-size: 0.9rem; }
.grid { display: grid; gap: 1rem; }
.grid figure { margin: 0; }
.grid img { width: 100%; height: auto; border-radius: 4px; }
.actions { display: grid; grid-template-columns: 1fr 1fr; gap: 0.25rem; }
.actions form, .actions a { margin: 0; }
.notice { padding: 0.5rem 1rem; background: #ecfdf5; border-left: 4px solid #10b981; }
.error { padding: 0.5rem 1rem; background: #fef2f2; border-left: 4px solid #ef4444; }
"#;

/// Everything the gallery page shows.
pub struct GalleryView<'a> {
    pub query: &'a str,
    pub device: Device,
    pub images: &'a [StoredImage],
    pub report: Option<&'a BatchReport>,
}

pub fn gallery(view: &GalleryView<'_>) -> String {
    let mut body = String::new();

    if let Some(report) = view.report {
        push_report(&mut body, report);
    }

    let _ = write!(
        body,
        r#"<form method="post" action="/upload" enctype="multipart/form-data">
<input type="hidden" name="device" value="{device}">
<label>Choose images <input type="file" name="files" multiple accept=".jpg,.jpeg,.png"></label>
<button type="submit">Upload</button>
</form>
<form method="get" action="/">
<input type="hidden" name="device" value="{device}">
<input type="search" name="q" value="{query}" placeholder="Search images">
<button type="submit">Search</button>
</form>
"#,
        device = view.device,
        query = escape(view.query),
    );

    if view.images.is_empty() {
        body.push_str("<p>No images found.</p>\n");
    } else {
        push_grid(&mut body, view.images, view.query, view.device);
    }

    layout(&sidebar(view.device, view.query), &body)
}

pub fn preview(batch: &UploadBatch) -> String {
    let mut body = format!(
        "<p>{} image(s) selected, captioning on <b>{}</b>.</p>\n",
        batch.items.len(),
        batch.device
    );

    let _ = write!(
        body,
        r#"<div class="grid" style="grid-template-columns: repeat({GRID_COLUMNS}, 1fr)">"#
    );
    for (index, item) in batch.items.iter().enumerate() {
        let _ = write!(
            body,
            r#"<figure><img src="/batches/{id}/{index}" alt="{name}"><figcaption>{name}</figcaption></figure>"#,
            id = batch.id,
            name = escape(&item.file_name),
        );
    }
    body.push_str("</div>\n");

    let _ = write!(
        body,
        r#"<form method="post" action="/batches/{id}/continue"><button type="submit">Continue</button></form>
<form method="post" action="/batches/{id}/discard"><input type="hidden" name="device" value="{device}"><button type="submit">Discard</button></form>
"#,
        id = batch.id,
        device = batch.device,
    );

    layout(&sidebar(batch.device, ""), &body)
}

pub fn error(message: &str) -> String {
    let body = format!(
        "<p class=\"error\">{}</p>\n<p><a href=\"/\">Back to gallery</a></p>\n",
        escape(message)
    );
    layout("", &body)
}

fn layout(sidebar: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="utf-8"><title>Google Photos Replica</title><style>{STYLE}</style></head>
<body>
<aside>{sidebar}</aside>
<main>
<h1>{TITLE}</h1>
<h6>Upload and Organize Your Photos with AI-generated Captions</h6>
{body}</main>
</body>
</html>
"#
    )
}

fn sidebar(selected: Device, query: &str) -> String {
    let mut html = String::from(
        "<h2>Settings</h2>\n<form method=\"get\" action=\"/\">\n<label>Device <select name=\"device\" onchange=\"this.form.submit()\">",
    );
    for device in Device::ALL {
        let attr = if device == selected { " selected" } else { "" };
        let _ = write!(html, r#"<option value="{device}"{attr}>{device}</option>"#);
    }
    let _ = write!(
        html,
        "</select></label>\n<input type=\"hidden\" name=\"q\" value=\"{}\">\n<noscript><button type=\"submit\">Apply</button></noscript>\n</form>\n",
        escape(query)
    );
    html
}

fn push_report(body: &mut String, report: &BatchReport) {
    let _ = write!(body, "<div class=\"notice\"><p>{}</p>", report.progress_text());
    let failures: Vec<(&str, &str)> = report
        .outcomes
        .iter()
        .filter_map(|o| match o {
            ItemOutcome::Failed { original, reason } => Some((original.as_str(), reason.as_str())),
            ItemOutcome::Saved { .. } => None,
        })
        .collect();
    if !failures.is_empty() {
        body.push_str("<ul>");
        for (name, reason) in failures {
            let _ = write!(body, "<li>{}: {}</li>", escape(name), escape(reason));
        }
        body.push_str("</ul>");
    }
    body.push_str("</div>\n");
}

fn push_grid(body: &mut String, images: &[StoredImage], query: &str, device: Device) {
    let _ = write!(
        body,
        r#"<div class="grid" style="grid-template-columns: repeat({GRID_COLUMNS}, 1fr)">"#
    );
    for image in images {
        let path = escape(&encode_path_segment(&image.file_name));
        let name = escape(&image.file_name);
        let alt = escape(image.caption.as_deref().unwrap_or(&image.file_name));
        let _ = write!(
            body,
            r#"<figure><img src="/images/{path}" alt="{alt}">
<div class="actions"><a href="/images/{path}/download" download="{name}"><button type="button">Download</button></a>
<form method="post" action="/images/{path}/delete"><input type="hidden" name="q" value="{q}"><input type="hidden" name="device" value="{device}"><button type="submit">Delete</button></form></div></figure>
"#,
            q = escape(query),
        );
    }
    body.push_str("</div>\n");
}

/// Gallery URL that keeps the search and the selected device.
pub fn gallery_url(query: &str, device: Device) -> String {
    if query.trim().is_empty() {
        format!("/?device={device}")
    } else {
        format!("/?q={}&device={device}", encode_query(query))
    }
}

/// Escape text for HTML element content and quoted attributes.
pub fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Percent-encode a query-string value.
pub fn encode_query(raw: &str) -> String {
    percent_encode(raw, true)
}

/// Percent-encode one URL path segment.
pub fn encode_path_segment(raw: &str) -> String {
    percent_encode(raw, false)
}

fn percent_encode(raw: &str, space_as_plus: bool) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(byte as char),
            b' ' if space_as_plus => out.push('+'),
            _ => {
                let _ = write!(out, "%{byte:02X}");
            }
        }
    }
    out
}
