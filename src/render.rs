//! Display formatting for assistant replies.
//!
//! [`render_message`] turns the raw accumulated reply into display markup. It is
//! always applied to the whole reply, never to a fragment, so the output only
//! depends on the text received so far and not on how it was chunked.
//!
//! Markup already present in the text (tags, existing anchors) is passed
//! through untouched. Nothing inside a tag or inside an `<a>` element is ever
//! linked again, which keeps rendering idempotent.

use aho_corasick::AhoCorasick;
use std::sync::OnceLock;

const LINE_BREAK: &str = "<br />";
const URL_SCHEMES: [&str; 2] = ["http://", "https://"];
/// Characters that mark a URL as already being part of markup or syntax.
const URL_GUARD_CHARS: [char; 4] = ['=', '"', '\'', '('];
const URL_TRAILING_PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?'];
/// Element names recognised as markup; any other `<name` is prose.
const KNOWN_TAGS: &[&str] = &[
    "a", "abbr", "b", "blockquote", "br", "code", "del", "div", "em", "h1", "h2", "h3", "h4",
    "h5", "h6", "hr", "i", "img", "li", "ol", "p", "pre", "s", "small", "span", "strong", "sub",
    "sup", "table", "tbody", "td", "th", "thead", "tr", "u", "ul",
];

pub fn render_message(text: &str) -> String {
    let text = render_line_breaks(text);
    let text = render_bold(&text);
    let text = render_markdown_links(&text);
    render_bare_urls(&text)
}

fn render_line_breaks(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\n', LINE_BREAK)
}

/// `**text**` becomes `<b>text</b>`; the closing marker is the nearest one.
fn render_bold(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(open) = rest.find("**") {
        let after_open = &rest[open + 2..];
        match after_open.find("**") {
            Some(close) if close > 0 => {
                out.push_str(&rest[..open]);
                out.push_str("<b>");
                out.push_str(&after_open[..close]);
                out.push_str("</b>");
                rest = &after_open[close + 2..];
            }
            _ => {
                out.push_str(&rest[..open + 2]);
                rest = after_open;
            }
        }
    }

    out.push_str(rest);
    out
}

/// `[label](url)` becomes an anchor opening in a new tab.
fn render_markdown_links(text: &str) -> String {
    if !text.contains("](") {
        return text.to_string();
    }
    rewrite_outside_markup(text, |rest, _| {
        let after_bracket = rest.strip_prefix('[')?;
        let label_end = after_bracket.find(']')?;
        let label = &after_bracket[..label_end];
        if label.trim().is_empty() || label.contains('[') {
            return None;
        }

        let after_label = after_bracket[label_end + 1..].strip_prefix('(')?;
        let url_end = closing_paren(after_label)?;
        let url = &after_label[..url_end];
        if !is_plain_url(url) {
            return None;
        }

        // '[' + label + ']' + '(' + url + ')'
        let consumed = 1 + label_end + 2 + url_end + 1;
        Some((anchor(url, label), consumed))
    })
}

/// Bare `http(s)://` URLs in plain text become anchors.
fn render_bare_urls(text: &str) -> String {
    if !url_scheme_matcher().is_match(text) {
        return text.to_string();
    }
    rewrite_outside_markup(text, |rest, preceding| {
        if !URL_SCHEMES.iter().any(|scheme| starts_with_ignore_case(rest, scheme)) {
            return None;
        }
        if preceding.is_some_and(|c| URL_GUARD_CHARS.contains(&c)) {
            return None;
        }

        let end = rest
            .find(|c: char| c.is_whitespace() || matches!(c, '<' | '>' | '"' | '\''))
            .unwrap_or(rest.len());
        let url = trim_url_end(&rest[..end]);
        let has_host = URL_SCHEMES
            .iter()
            .any(|scheme| url.len() > scheme.len() && starts_with_ignore_case(url, scheme));
        if !has_host {
            return None;
        }

        Some((anchor(url, url), url.len()))
    })
}

/// Index of the `)` that closes an already opened `(`, skipping nested pairs.
fn closing_paren(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (index, c) in text.char_indices() {
        match c {
            '(' => depth += 1,
            ')' if depth == 0 => return Some(index),
            ')' => depth -= 1,
            _ => {}
        }
    }
    None
}

/// Drops sentence punctuation after a URL. A trailing `)` is kept when it
/// closes a `(` inside the URL.
fn trim_url_end(candidate: &str) -> &str {
    let mut url = candidate;
    while let Some(last) = url.chars().next_back() {
        let strip = match last {
            ')' => url.matches(')').count() > url.matches('(').count(),
            c => URL_TRAILING_PUNCTUATION.contains(&c),
        };
        if !strip {
            break;
        }
        url = &url[..url.len() - last.len_utf8()];
    }
    url
}

fn anchor(url: &str, label: &str) -> String {
    format!("<a href=\"{url}\" target=\"_blank\" rel=\"noopener noreferrer\">{label}</a>")
}

fn is_plain_url(url: &str) -> bool {
    !url.is_empty()
        && !url
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '<' | '>'))
}

fn starts_with_ignore_case(text: &str, prefix: &str) -> bool {
    text.len() >= prefix.len()
        && text.is_char_boundary(prefix.len())
        && text[..prefix.len()].eq_ignore_ascii_case(prefix)
}

fn url_scheme_matcher() -> &'static AhoCorasick {
    static MATCHER: OnceLock<AhoCorasick> = OnceLock::new();
    MATCHER.get_or_init(|| {
        AhoCorasick::builder()
            .ascii_case_insensitive(true)
            .build(URL_SCHEMES)
            .expect("static URL scheme patterns are valid")
    })
}

#[derive(Debug, PartialEq, Eq)]
enum TagKind {
    AnchorOpen,
    AnchorClose,
    Other,
}

/// Byte length of the tag opening at the start of `rest`, if any.
///
/// Only known element names with well-formed attributes count as markup, so
/// prose such as `a<b and c>d` is scanned as text.
fn tag_len(rest: &str) -> Option<usize> {
    let body = rest.strip_prefix('<')?;
    if body.starts_with("!--") {
        return rest.find("-->").map(|end| end + 3);
    }

    let (closing, body) = match body.strip_prefix('/') {
        Some(body) => (true, body),
        None => (false, body),
    };
    let name_len = body
        .find(|c: char| !c.is_ascii_alphanumeric())
        .unwrap_or(body.len());
    let name = body[..name_len].to_ascii_lowercase();
    if !KNOWN_TAGS.contains(&name.as_str()) {
        return None;
    }

    let end = body.find('>')?;
    let attributes = &body[name_len..end];
    let well_formed = if closing {
        attributes.trim().is_empty()
    } else {
        attributes.is_empty()
            || (attributes.starts_with(|c: char| c.is_whitespace() || c == '/')
                && parse_attributes(attributes).is_some())
    };
    if !well_formed {
        return None;
    }

    Some(1 + usize::from(closing) + end + 1)
}

/// Accepts `name`, `name=value`, `name="value"` and `name='value'` pairs,
/// optionally followed by a self-closing `/`.
fn parse_attributes(attributes: &str) -> Option<()> {
    let mut rest = attributes.trim_start();
    while !rest.is_empty() {
        if let Some(after_slash) = rest.strip_prefix('/') {
            return after_slash.trim().is_empty().then_some(());
        }

        let name_len = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_'))
            .unwrap_or(rest.len());
        if name_len == 0 {
            return None;
        }
        rest = rest[name_len..].trim_start();

        if let Some(value) = rest.strip_prefix('=') {
            let value = value.trim_start();
            let value_len = match value.chars().next()? {
                quote @ ('"' | '\'') => value[1..].find(quote)? + 2,
                _ => value
                    .find(|c: char| c.is_whitespace() || matches!(c, '"' | '\'' | '<' | '=' | '`'))
                    .unwrap_or(value.len()),
            };
            if value_len == 0 {
                return None;
            }
            rest = value[value_len..].trim_start();
        }
    }
    Some(())
}

fn classify_tag(tag: &str) -> TagKind {
    let lower = tag.to_ascii_lowercase();
    let ends_name = |rest: &str| {
        rest.chars()
            .next()
            .map_or(true, |c| c.is_whitespace() || c == '>' || c == '/')
    };

    if let Some(rest) = lower.strip_prefix("</a") {
        if ends_name(rest) {
            return TagKind::AnchorClose;
        }
    } else if let Some(rest) = lower.strip_prefix("<a") {
        if ends_name(rest) {
            return TagKind::AnchorOpen;
        }
    }
    TagKind::Other
}

/// Walks `text`, copying tags and anchor contents verbatim and offering every
/// other position to `rewrite`.
///
/// `rewrite` receives the remaining text and the preceding character, and
/// returns the replacement plus the number of bytes it consumed.
fn rewrite_outside_markup<F>(text: &str, mut rewrite: F) -> String
where
    F: FnMut(&str, Option<char>) -> Option<(String, usize)>,
{
    let mut out = String::with_capacity(text.len());
    let mut anchor_depth = 0usize;
    let mut index = 0;
    let mut preceding = None;

    while index < text.len() {
        let rest = &text[index..];

        if let Some(len) = tag_len(rest) {
            let tag = &rest[..len];
            match classify_tag(tag) {
                TagKind::AnchorOpen => anchor_depth += 1,
                TagKind::AnchorClose => anchor_depth = anchor_depth.saturating_sub(1),
                TagKind::Other => {}
            }
            out.push_str(tag);
            index += len;
            preceding = Some('>');
            continue;
        }

        if anchor_depth == 0 {
            if let Some((replacement, consumed)) = rewrite(rest, preceding) {
                out.push_str(&replacement);
                preceding = rest[..consumed].chars().next_back();
                index += consumed;
                continue;
            }
        }

        let Some(ch) = rest.chars().next() else {
            break;
        };
        out.push(ch);
        preceding = Some(ch);
        index += ch.len_utf8();
    }

    out
}
