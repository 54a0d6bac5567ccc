//! First-statement splitting for multi-statement query strings.
//!
//! Scans for the first semicolon that is not inside a quoted string or a
//! comment; the text after it is returned verbatim (modulo leading
//! whitespace) so the caller can feed it back one statement at a time.

/// Split off the first statement. Returns `(first, remainder)`; the
/// remainder is empty when the input holds a single statement.
pub fn split_statement(sql: &str) -> (&str, &str) {
    let bytes = sql.as_bytes();
    let mut i = 0;

    let mut in_single = false;
    let mut in_double = false;
    let mut in_backtick = false;
    let mut in_line_comment = false;
    let mut in_block_comment = false;

    while i < bytes.len() {
        let b = bytes[i];

        if in_line_comment {
            if b == b'\n' {
                in_line_comment = false;
            }
            i += 1;
            continue;
        }
        if in_block_comment {
            if b == b'*' && bytes.get(i + 1) == Some(&b'/') {
                in_block_comment = false;
                i += 2;
                continue;
            }
            i += 1;
            continue;
        }

        if !in_single && !in_double && !in_backtick {
            match b {
                b'-' if bytes.get(i + 1) == Some(&b'-') => {
                    in_line_comment = true;
                    i += 2;
                    continue;
                }
                b'#' => {
                    in_line_comment = true;
                    i += 1;
                    continue;
                }
                b'/' if bytes.get(i + 1) == Some(&b'*') => {
                    in_block_comment = true;
                    i += 2;
                    continue;
                }
                b';' => {
                    let first = sql[..i].trim();
                    let remainder = sql[i + 1..].trim_start();
                    let remainder = if remainder.trim().is_empty() {
                        ""
                    } else {
                        remainder
                    };
                    return (first, remainder);
                }
                _ => {}
            }
        }

        match b {
            b'\\' if (in_single || in_double) && i + 1 < bytes.len() => {
                // Backslash escape inside a string literal.
                i += 2;
                continue;
            }
            b'\'' if !in_double && !in_backtick => in_single = !in_single,
            b'"' if !in_single && !in_backtick => in_double = !in_double,
            b'`' if !in_single && !in_double => in_backtick = !in_backtick,
            _ => {}
        }
        i += 1;
    }

    (sql.trim(), "")
}
