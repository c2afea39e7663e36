//! Indentation trimming of template literal spans.
//!
//! Templates are usually written indented inside source code:
//!
//! ```text
//! let turn = Turn::assistant()
//!     .text("
//!         The following is a character profile.
//!         Name: ")
//! ```
//!
//! When the first line of the first span is blank, the indentation of the second line is taken as the template
//! indentation and removed from every line of every span. Text that directly follows a node on the same line is kept
//! untouched.

/// Number of leading whitespace characters.
fn leading_whitespace(line: &str) -> usize {
    line.chars().take_while(|c| c.is_whitespace()).count()
}

/// `line` without its first `n` characters.
fn skip_chars(line: &str, n: usize) -> &str {
    match line.char_indices().nth(n) {
        Some((idx, _)) => &line[idx..],
        None => "",
    }
}

fn trim_line(line: &str, indent: usize) -> &str {
    let leading = leading_whitespace(line);
    if leading == 0 {
        line
    } else if leading <= indent {
        line.trim_start()
    } else {
        skip_chars(line, indent)
    }
}

/// Trim the template indentation from literal spans. Returns the spans unchanged if the template is not indented.
pub fn trim_template<S: AsRef<str>>(spans: &[S]) -> Vec<String> {
    let untouched = || spans.iter().map(|s| s.as_ref().to_string()).collect();
    let Some(first) = spans.first().map(AsRef::as_ref) else {
        return Vec::new();
    };
    let mut first_lines = first.split('\n');
    let opening_blank = first_lines.next().map_or(false, |line| line.trim().is_empty());
    let indent = match first_lines.next() {
        Some(line) if opening_blank => leading_whitespace(line),
        _ => 0,
    };
    if indent == 0 {
        return untouched();
    }
    spans.iter()
        .enumerate()
        .map(|(i, span)| {
            let lines = span.as_ref().split('\n');
            // the opening blank line is dropped
            let skip = if i == 0 { 1 } else { 0 };
            lines.skip(skip)
                .enumerate()
                .map(|(j, line)| {
                    if i > 0 && j == 0 && !line.trim().is_empty() {
                        // `{[node]}  text` keeps the text after the node as written
                        line
                    } else {
                        trim_line(line, indent)
                    }
                })
                .collect::<Vec<_>>()
                .join("\n")
        })
        .collect()
}
