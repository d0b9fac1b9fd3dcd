//! Placeholder substitution for campaign templates.
//!
//! Placeholders are written `{{name}}` or `{{ name }}` where `name` is made of
//! ASCII letters, digits and underscores. Unknown names render as an empty
//! string; anything else between braces is copied through untouched.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{campaign::Variables, feed::Recipient};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub subject: String,
    pub html: String,
    #[serde(default)]
    pub text: Option<String>,
}

impl Template {
    pub fn new(subject: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            html: html.into(),
            text: None,
        }
    }

    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Distinct placeholder names used anywhere in the template, sorted
    #[must_use]
    pub fn variables(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        for source in [Some(&self.subject), Some(&self.html), self.text.as_ref()]
            .into_iter()
            .flatten()
        {
            scan(source, |token| match token {
                Token::Literal(_) => {}
                Token::Placeholder(name) => {
                    names.insert(name.to_string());
                }
            });
        }
        names
    }
}

/// Fully substituted content for one recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedContent {
    pub subject: String,
    pub html: String,
    pub text: String,
}

/// Render `template` for `recipient`.
///
/// The recipient address is exposed as `email` unless the row already
/// carries an `email` column. Without a plain-text body one is derived from
/// the rendered HTML.
#[must_use]
pub fn render(template: &Template, recipient: &Recipient) -> RenderedContent {
    let lookup = |name: &str| -> String {
        recipient.variables.get(name).map_or_else(
            || {
                if name == "email" {
                    recipient.address.to_string()
                } else {
                    String::new()
                }
            },
            str::to_string,
        )
    };

    let html = substitute_with(&template.html, &lookup);
    let text = template.text.as_deref().map_or_else(
        || strip_markup(&html),
        |text| substitute_with(text, &lookup),
    );

    RenderedContent {
        subject: substitute_with(&template.subject, &lookup),
        html,
        text,
    }
}

/// Substitute `variables` into a single template string
#[must_use]
pub fn substitute(source: &str, variables: &Variables) -> String {
    substitute_with(source, &|name: &str| {
        variables.get(name).unwrap_or_default().to_string()
    })
}

fn substitute_with(source: &str, lookup: &dyn Fn(&str) -> String) -> String {
    let mut out = String::with_capacity(source.len());
    scan(source, |token| match token {
        Token::Literal(text) => out.push_str(text),
        Token::Placeholder(name) => out.push_str(&lookup(name)),
    });
    out
}

enum Token<'a> {
    Literal(&'a str),
    Placeholder(&'a str),
}

fn scan<'a>(source: &'a str, mut emit: impl FnMut(Token<'a>)) {
    let mut rest = source;

    while let Some(open) = rest.find("{{") {
        let after_open = &rest[open + 2..];
        let Some(close) = after_open.find("}}") else {
            break;
        };

        let name = after_open[..close].trim();
        let is_identifier = !name.is_empty()
            && name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_');

        if is_identifier {
            emit(Token::Literal(&rest[..open]));
            emit(Token::Placeholder(name));
            rest = &after_open[close + 2..];
        } else {
            // Not a placeholder: keep the braces and continue after them
            emit(Token::Literal(&rest[..open + 2]));
            rest = after_open;
        }
    }

    emit(Token::Literal(rest));
}

/// Elements whose closing tag ends a line of text
const BLOCK_ELEMENTS: &[&str] = &[
    "p", "div", "li", "tr", "h1", "h2", "h3", "h4", "h5", "h6", "table", "blockquote",
];

/// Derive a plain-text body from HTML.
#[must_use]
pub fn strip_markup(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut rest = html;

    while let Some(start) = rest.find('<') {
        text.push_str(&rest[..start]);
        let tag_source = &rest[start + 1..];
        let Some(end) = tag_source.find('>') else {
            text.push_str(&rest[start..]);
            rest = "";
            break;
        };

        let tag = tag_source[..end].trim().to_ascii_lowercase();
        let tag_name = tag
            .split(|c: char| c.is_whitespace() || c == '/')
            .find(|part| !part.is_empty())
            .unwrap_or_default();
        rest = &tag_source[end + 1..];

        if !tag.starts_with('/') && matches!(tag_name, "script" | "style") {
            let closing = format!("</{tag_name}");
            let lowered = rest.to_ascii_lowercase();
            rest = lowered.find(&closing).map_or("", |idx| {
                let after = &rest[idx..];
                after.find('>').map_or("", |gt| &after[gt + 1..])
            });
            continue;
        }

        let closes_block = tag.starts_with('/') && BLOCK_ELEMENTS.contains(&tag_name);
        if tag_name == "br" || closes_block {
            text.push('\n');
        }
    }
    text.push_str(rest);

    let decoded = decode_entities(&text);

    let mut lines: Vec<String> = Vec::new();
    for line in decoded.lines() {
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() && lines.last().is_none_or(String::is_empty) {
            continue;
        }
        lines.push(collapsed);
    }

    lines.join("\n").trim().to_string()
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}
