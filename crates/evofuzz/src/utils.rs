//! Small helpers shared across the crate.

/// Split a command line the way a POSIX shell tokenizes words: whitespace
/// separates arguments, single quotes preserve everything literally, double
/// quotes preserve everything but allow backslash escapes, and a backslash
/// outside quotes escapes the next character.
pub fn shell_split(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(ch) = chars.next() {
        match ch {
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                for c in chars.by_ref() {
                    if c == '\'' {
                        break;
                    }
                    current.push(c);
                }
            }
            '"' => {
                in_word = true;
                while let Some(c) = chars.next() {
                    match c {
                        '"' => break,
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                current.push(escaped);
                            }
                        }
                        _ => current.push(c),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            _ => {
                in_word = true;
                current.push(ch);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

/// Classic 16-bytes-per-row hex dump with an ASCII gutter.
pub fn hexdump(bytes: &[u8]) -> String {
    let mut out = String::new();
    for (row, chunk) in bytes.chunks(16).enumerate() {
        out.push_str(&format!("{:08x}  ", row * 16));
        for i in 0..16 {
            match chunk.get(i) {
                Some(b) => out.push_str(&format!("{b:02x} ")),
                None => out.push_str("   "),
            }
            if i == 7 {
                out.push(' ');
            }
        }
        out.push(' ');
        for b in chunk {
            out.push(if b.is_ascii_graphic() || *b == b' ' {
                *b as char
            } else {
                '.'
            });
        }
        out.push('\n');
    }
    out
}

/// Turn a species label into something safe as a directory name.
pub fn sanitize_label(label: &str) -> String {
    label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{hexdump, sanitize_label, shell_split};

    #[test]
    fn split_plain_words() {
        assert_eq!(shell_split("./target 2404 -v"), vec![
            "./target", "2404", "-v"
        ]);
    }

    #[test]
    fn split_quoted_words() {
        assert_eq!(shell_split(r#"srv --name "a b" 'c d'"#), vec![
            "srv", "--name", "a b", "c d"
        ]);
    }

    #[test]
    fn split_escapes() {
        assert_eq!(shell_split(r"a\ b c"), vec!["a b", "c"]);
        assert_eq!(shell_split(r#""a\"b""#), vec![r#"a"b"#]);
    }

    #[test]
    fn split_empty_quotes_produce_empty_arg() {
        assert_eq!(shell_split("run ''"), vec!["run", ""]);
    }

    #[test]
    fn split_whitespace_only() {
        assert!(shell_split("   \t ").is_empty());
    }

    #[test]
    fn sanitize_species() {
        assert_eq!(sanitize_label("IEC-104 I APDU"), "IEC-104_I_APDU");
        assert_eq!(sanitize_label("raw"), "raw");
    }

    #[test]
    fn hexdump_rows_and_gutter() {
        let dump = hexdump(b"\x68\x04ABCDEFGHIJKLMNOPQR");
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("00000000  68 04 41 42 43 44 45 46  47 48"));
        assert!(lines[0].ends_with("h.ABCDEFGHIJKLMN"));
        assert!(lines[1].starts_with("00000010  4f 50"));
        assert!(dump.ends_with('\n'));
    }

    #[test]
    fn hexdump_of_nothing_is_empty() {
        assert!(hexdump(b"").is_empty());
    }
}
