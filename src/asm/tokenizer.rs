//! Source-line tokenizer: splits an assembly line into
//! (label, mnemonic, operand, comment).
//!
//! Labels start in column 0; the mnemonic is canonicalized to upper
//! case; the operand runs to the first unquoted `;`.

/// One tokenized source line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceLine {
    pub line_number: u32,
    pub label: String,
    pub mnemonic: String,
    pub operand: String,
    pub comment: String,
    pub raw: String,
}

impl SourceLine {
    pub fn is_comment_only(&self) -> bool {
        self.label.is_empty() && self.mnemonic.is_empty()
    }
}

fn is_space(c: char) -> bool {
    c == ' ' || c == '\t'
}

fn is_label_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '@'
}

fn is_label_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '@'
}

/// Find the first `;` that is not inside a `'x'` character literal or
/// a quoted string.
fn find_comment_start(s: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (i, c) in s.char_indices() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => quote = Some(c),
                ';' => return Some(i),
                _ => {}
            },
        }
    }
    None
}

/// Tokenize one line of source.
pub fn parse_line(text: &str, line_number: u32) -> SourceLine {
    let mut line = SourceLine {
        line_number,
        raw: text.to_string(),
        ..Default::default()
    };

    // Comment-only lines: `*` or `;` in column 0, or nothing but blanks.
    if text.is_empty()
        || text.starts_with('*')
        || text.starts_with(';')
        || text.chars().all(is_space)
    {
        line.comment = text.to_string();
        return line;
    }

    let chars: Vec<char> = text.chars().collect();
    let len = chars.len();
    let mut pos = 0;

    // Label only when the line starts without leading whitespace.
    if is_label_start(chars[0]) {
        let mut end = 0;
        while end < len && is_label_char(chars[end]) {
            end += 1;
        }
        line.label = chars[..end].iter().collect();
        pos = end;
        if pos < len && chars[pos] == ':' {
            pos += 1;
        }
    }

    while pos < len && is_space(chars[pos]) {
        pos += 1;
    }

    // Mnemonic, upper-cased.
    if pos < len && chars[pos] != ';' {
        let start = pos;
        while pos < len && !is_space(chars[pos]) && chars[pos] != ';' {
            pos += 1;
        }
        line.mnemonic = chars[start..pos]
            .iter()
            .collect::<String>()
            .to_ascii_uppercase();
    }

    while pos < len && is_space(chars[pos]) {
        pos += 1;
    }

    // Operand up to the first unquoted `;`, trailing blanks trimmed.
    if pos < len {
        let rest: String = chars[pos..].iter().collect();
        match find_comment_start(&rest) {
            Some(ci) => {
                line.operand = rest[..ci].trim_end().to_string();
                line.comment = rest[ci..].to_string();
            }
            None => {
                line.operand = rest.trim_end().to_string();
            }
        }
    }

    line
}
