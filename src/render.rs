//! Report rendering.
//!
//! The engine hands the compiled markdown to a [`ReportRenderer`] and attaches
//! whatever comes back to the publish payload without inspecting it.

use pulldown_cmark::{html, Options, Parser};
use serde::Serialize;
use thiserror::Error;

use crate::subjects::Subject;

/// Displayable variants of a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedReport {
    pub title: String,
    pub markdown: String,
    pub html: String,
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("report for subject {0} is empty")]
    Empty(i64),
}

pub trait ReportRenderer: Send + Sync {
    fn render(&self, subject: &Subject, markdown: &str) -> Result<RenderedReport, RenderError>;
}

/// Markdown to HTML via pulldown-cmark.
#[derive(Debug, Default, Clone, Copy)]
pub struct HtmlReportRenderer;

impl ReportRenderer for HtmlReportRenderer {
    fn render(&self, subject: &Subject, markdown: &str) -> Result<RenderedReport, RenderError> {
        let markdown = markdown.trim();
        if markdown.is_empty() {
            return Err(RenderError::Empty(subject.id));
        }

        let mut options = Options::empty();
        options.insert(Options::ENABLE_TABLES);
        options.insert(Options::ENABLE_STRIKETHROUGH);

        let mut body = String::with_capacity(markdown.len() * 2);
        html::push_html(&mut body, Parser::new_ext(markdown, options));

        Ok(RenderedReport {
            title: extract_title(markdown)
                .unwrap_or_else(|| format!("{} Research Report", subject.name)),
            markdown: markdown.to_string(),
            html: body,
        })
    }
}

/// First level-one heading, if any.
fn extract_title(markdown: &str) -> Option<String> {
    markdown
        .lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("# "))
        .map(|title| title.trim().to_string())
        .filter(|title| !title.is_empty())
}
