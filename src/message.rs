//! Plain builder for Telegram `parse_mode: "HTML"` message bodies.

/// Builds an HTML-formatted message body.
///
/// Content passed to the styling methods is HTML-escaped; use [`raw`] for
/// text that is already formatted.
///
/// [`raw`]: MessageBuilder::raw
#[derive(Debug, Clone, Default)]
pub struct MessageBuilder {
    body: String,
}

impl MessageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an already-formatted body.
    pub fn from_text(text: impl Into<String>) -> Self {
        Self { body: text.into() }
    }

    /// Append pre-formatted content without escaping.
    pub fn raw(mut self, content: &str) -> Self {
        self.body.push_str(content);
        self
    }

    /// Append plain text, escaped for HTML parse mode.
    pub fn text(self, content: &str) -> Self {
        let escaped = escape_html(content);
        self.raw(&escaped)
    }

    pub fn bold(self, content: &str) -> Self {
        self.tagged("b", content)
    }

    pub fn italic(self, content: &str) -> Self {
        self.tagged("i", content)
    }

    pub fn code(self, content: &str) -> Self {
        self.tagged("code", content)
    }

    pub fn underline(self, content: &str) -> Self {
        self.tagged("u", content)
    }

    pub fn space(self) -> Self {
        self.raw(" ")
    }

    pub fn newline(mut self, count: usize) -> Self {
        for _ in 0..count {
            self.body.push('\n');
        }
        self
    }

    /// Apply `f` only when `condition` holds.
    pub fn when(self, condition: bool, f: impl FnOnce(Self) -> Self) -> Self {
        if condition {
            f(self)
        } else {
            self
        }
    }

    pub fn build(self) -> String {
        self.body
    }

    fn tagged(mut self, tag: &str, content: &str) -> Self {
        self.body.push('<');
        self.body.push_str(tag);
        self.body.push('>');
        self.body.push_str(&escape_html(content));
        self.body.push_str("</");
        self.body.push_str(tag);
        self.body.push('>');
        self
    }
}

pub(crate) fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}
