//! Markdown report to standalone HTML.

use std::path::{Path, PathBuf};

use askama::Template;
use async_trait::async_trait;
use pulldown_cmark::{html, Options, Parser};
use tokio::fs;
use tracing::debug;

use crate::stages::{DocumentConverter, StageError};

const REPLACEMENTS: &[(char, &str)] = &[
    ('\u{2013}', "-"),
    ('\u{2014}', "--"),
    ('\u{2015}', "--"),
    ('\u{2212}', "-"),
    ('\u{2018}', "'"),
    ('\u{2019}', "'"),
    ('\u{201A}', "'"),
    ('\u{201B}', "'"),
    ('\u{201C}', "\""),
    ('\u{201D}', "\""),
    ('\u{201E}', "\""),
    ('\u{201F}', "\""),
    ('\u{00AB}', "\""),
    ('\u{00BB}', "\""),
    ('\u{2026}', "..."),
    ('\u{00A0}', " "),
    ('\u{2002}', " "),
    ('\u{2003}', " "),
    ('\u{2009}', " "),
    ('\u{200A}', " "),
    ('\u{200B}', ""),
    ('\u{2022}', "*"),
    ('\u{2192}', "->"),
    ('\u{2190}', "<-"),
    ('\u{2264}', "<="),
    ('\u{2265}', ">="),
];

/// Replaces smart quotes, dashes, ellipses and exotic spaces with ASCII.
pub fn normalize_typography(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match REPLACEMENTS.iter().find(|(from, _)| *from == ch) {
            Some((_, to)) => out.push_str(to),
            None => out.push(ch),
        }
    }
    out
}

#[derive(Template)]
#[template(
    source = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>{{ title }}</title>
<style>
body { font-family: Helvetica, Arial, sans-serif; max-width: 52rem; margin: 2rem auto; line-height: 1.5; color: #222; }
h1, h2, h3 { color: #1a3d6d; }
table { border-collapse: collapse; width: 100%; }
th, td { border: 1px solid #ccc; padding: 0.3rem 0.5rem; text-align: left; }
code { background: #f4f4f4; padding: 0 0.2rem; }
</style>
</head>
<body>
{{ body|safe }}
</body>
</html>
"#,
    ext = "html"
)]
struct ReportPage<'a> {
    title: &'a str,
    body: &'a str,
}

/// Renders markdown into a complete HTML page titled `title`.
pub fn markdown_to_html(markdown: &str, title: &str) -> Result<String, StageError> {
    let normalized = normalize_typography(markdown);
    let options = Options::ENABLE_TABLES | Options::ENABLE_STRIKETHROUGH | Options::ENABLE_TASKLISTS;
    let parser = Parser::new_ext(&normalized, options);
    let mut body = String::with_capacity(normalized.len() * 3 / 2);
    html::push_html(&mut body, parser);
    ReportPage { title, body: &body }
        .render()
        .map_err(|e| StageError::Render(e.to_string()))
}

/// Writes `<name>.html` next to the markdown report.
#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlConverter;

#[async_trait]
impl DocumentConverter for HtmlConverter {
    async fn convert(&self, markdown_path: &Path) -> Result<PathBuf, StageError> {
        let markdown = fs::read_to_string(markdown_path)
            .await
            .map_err(|e| StageError::io(markdown_path, e))?;
        let title = markdown_path
            .file_stem()
            .map(|s| s.to_string_lossy().replace('_', " "))
            .unwrap_or_else(|| "Opportunity Report".to_string());
        let page = markdown_to_html(&markdown, &title)?;

        let target = markdown_path.with_extension("html");
        fs::write(&target, page)
            .await
            .map_err(|e| StageError::io(&target, e))?;
        debug!(path = %target.display(), "html report written");
        Ok(target)
    }
}
