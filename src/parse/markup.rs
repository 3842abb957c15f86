//! HTML and Markdown, sectioned by headings.

use pulldown_cmark::{Event, Options, Parser, Tag, TagEnd};
use scraper::{ElementRef, Html};

use crate::error::IngestError;
use crate::models::Page;

use super::{decode_text, number_pages, ParseInput};

const SKIPPED_ELEMENTS: &[&str] = &["script", "style", "noscript", "head", "template"];

const BLOCK_ELEMENTS: &[&str] = &[
    "p", "div", "section", "article", "main", "header", "footer", "nav", "aside", "ul", "ol",
    "li", "table", "tr", "pre", "blockquote", "br", "hr", "dl", "dt", "dd", "figure",
    "figcaption", "form", "fieldset",
];

/// Accumulates text into heading-delimited sections.
#[derive(Default)]
struct Sections {
    done: Vec<(Option<String>, String)>,
    heading: Option<String>,
    buf: String,
}

impl Sections {
    fn start(&mut self, heading: String) {
        self.flush();
        self.buf.push_str(&heading);
        self.buf.push('\n');
        self.heading = Some(heading);
    }

    fn flush(&mut self) {
        let text = self.buf.trim().to_string();
        if !text.is_empty() {
            self.done.push((self.heading.take(), text));
        }
        self.heading = None;
        self.buf.clear();
    }

    /// Append a text run, collapsing whitespace but keeping word gaps.
    fn push_text(&mut self, raw: &str) {
        let words: Vec<&str> = raw.split_whitespace().collect();
        let at_gap = self.buf.is_empty() || self.buf.ends_with(char::is_whitespace);
        if words.is_empty() {
            if !raw.is_empty() && !at_gap {
                self.buf.push(' ');
            }
            return;
        }
        if raw.starts_with(char::is_whitespace) && !at_gap {
            self.buf.push(' ');
        }
        self.buf.push_str(&words.join(" "));
        if raw.ends_with(char::is_whitespace) {
            self.buf.push(' ');
        }
    }

    fn push_raw(&mut self, raw: &str) {
        self.buf.push_str(raw);
    }

    fn newline(&mut self) {
        while self.buf.ends_with(' ') {
            self.buf.pop();
        }
        if !self.buf.is_empty() && !self.buf.ends_with('\n') {
            self.buf.push('\n');
        }
    }

    fn finish(mut self) -> Vec<Page> {
        self.flush();
        number_pages(self.done)
    }
}

fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub(super) fn parse_html(input: &ParseInput<'_>) -> Result<Vec<Page>, IngestError> {
    let html = decode_text(input.bytes);
    let document = Html::parse_document(&html);
    let mut sections = Sections::default();
    walk_html(document.root_element(), &mut sections);
    Ok(sections.finish())
}

fn walk_html(element: ElementRef<'_>, sections: &mut Sections) {
    for child in element.children() {
        if let Some(child_el) = ElementRef::wrap(child) {
            let name = child_el.value().name();
            if SKIPPED_ELEMENTS.contains(&name) {
                continue;
            }
            if matches!(name, "h1" | "h2" | "h3" | "h4" | "h5" | "h6") {
                let heading = collapse(&child_el.text().collect::<String>());
                if !heading.is_empty() {
                    sections.start(heading);
                }
                continue;
            }
            let block = BLOCK_ELEMENTS.contains(&name);
            if block {
                sections.newline();
            }
            if name == "pre" {
                sections.push_raw(&child_el.text().collect::<String>());
            } else {
                walk_html(child_el, sections);
            }
            if block {
                sections.newline();
            }
            if matches!(name, "td" | "th") {
                sections.push_text(" ");
            }
        } else if let Some(text) = child.value().as_text() {
            sections.push_text(text);
        }
    }
}

pub(super) fn parse_markdown(input: &ParseInput<'_>) -> Result<Vec<Page>, IngestError> {
    let text = decode_text(input.bytes);
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);

    let mut sections = Sections::default();
    let mut heading: Option<String> = None;

    for event in Parser::new_ext(&text, options) {
        match event {
            Event::Start(Tag::Heading { .. }) => heading = Some(String::new()),
            Event::End(TagEnd::Heading(_)) => {
                if let Some(h) = heading.take() {
                    let h = collapse(&h);
                    if !h.is_empty() {
                        sections.start(h);
                    }
                }
            }
            Event::Text(t) | Event::Code(t) => match heading.as_mut() {
                Some(h) => h.push_str(&t),
                None => sections.push_raw(&t),
            },
            Event::SoftBreak => match heading.as_mut() {
                Some(h) => h.push(' '),
                None => sections.push_raw(" "),
            },
            Event::HardBreak => sections.push_raw("\n"),
            Event::End(TagEnd::TableCell) => sections.push_raw(" "),
            Event::End(
                TagEnd::Paragraph
                | TagEnd::Item
                | TagEnd::CodeBlock
                | TagEnd::TableHead
                | TagEnd::TableRow,
            ) => sections.newline(),
            _ => {}
        }
    }

    Ok(sections.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(bytes: &[u8]) -> ParseInput<'_> {
        ParseInput {
            bytes,
            name: "doc",
            content_type: "text/html",
            vision: false,
        }
    }

    #[test]
    fn html_sections_follow_headings_and_skip_scripts() {
        let html = br#"<html><head><title>T</title><style>p{}</style></head>
<body>
  <p>Intro   text.</p>
  <h1>Install</h1>
  <p>Run the <b>installer</b>.</p><script>alert(1)</script>
  <h2>Verify</h2>
  <ul><li>one</li><li>two</li></ul>
</body></html>"#;
        let pages = parse_html(&input(html)).unwrap();
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[0].text, "Intro text.");
        assert_eq!(pages[0].heading, None);
        assert_eq!(pages[1].heading.as_deref(), Some("Install"));
        assert_eq!(pages[1].text, "Install\nRun the installer.");
        assert_eq!(pages[2].text, "Verify\none\ntwo");
        assert_eq!(pages[2].number, 3);
        assert!(!pages.iter().any(|p| p.text.contains("alert")));
    }

    #[test]
    fn markdown_sections_strip_markup() {
        let md = b"Preface line.\n\n# Setup\n\nUse **cargo** and `rustup`.\n\n## Lists\n\n- alpha\n- beta\n";
        let pages = parse_markdown(&input(md)).unwrap();
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[0].text, "Preface line.");
        assert_eq!(pages[1].heading.as_deref(), Some("Setup"));
        assert_eq!(pages[1].text, "Setup\nUse cargo and rustup.");
        assert_eq!(pages[2].text, "Lists\nalpha\nbeta");
    }

    #[test]
    fn empty_markup_yields_no_pages() {
        assert!(parse_html(&input(b"<html><body>  </body></html>")).unwrap().is_empty());
        assert!(parse_markdown(&input(b"")).unwrap().is_empty());
    }
}
