//! HTML pages. Every page extends `templates/layout.html`; askama escapes
//! all interpolated values.

use askama::Template;
use tracing::error;

use crate::model::Record;

pub const STYLESHEET: &str = include_str!("static/style.css");

#[derive(Template)]
#[template(path = "form.html")]
struct FormPage<'a> {
    error: Option<&'a str>,
}

#[derive(Template)]
#[template(path = "details.html")]
struct DetailsPage {
    id: u64,
    value: f64,
    share_url: String,
}

#[derive(Template)]
#[template(path = "not_found.html")]
struct NotFoundPage;

#[derive(Template)]
#[template(path = "fault.html")]
struct FaultPage<'a> {
    status: u16,
    reason: &'a str,
}

fn render<T: Template>(page: T) -> String {
    page.render().unwrap_or_else(|e| {
        error!(error = %e, "template rendering failed");
        "<!doctype html><title>Error</title><p>Page could not be rendered.</p>".to_string()
    })
}

pub fn form(error: Option<&str>) -> String {
    render(FormPage { error })
}

/// Result page. `host` is the request's `Host` header; without one the share
/// link is relative.
pub fn details(record: &Record, host: Option<&str>) -> String {
    let path = format!("/show/{}", record.id);
    let share_url = match host {
        Some(host) => format!("http://{}{}", host, path),
        None => path,
    };
    render(DetailsPage {
        id: record.id,
        value: record.value,
        share_url,
    })
}

pub fn not_found() -> String {
    render(NotFoundPage)
}

pub fn fault(status: u16, reason: &str) -> String {
    render(FaultPage { status, reason })
}
