//! POSIX-shell style argument splitting and quoting.

/// Split a flag string the way `sh` would split words, honouring single
/// quotes, double quotes and backslash escapes. Unterminated quotes run to the
/// end of the input.
pub fn split_args(input: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_token = true;
                for q in chars.by_ref() {
                    if q == '\'' {
                        break;
                    }
                    current.push(q);
                }
            }
            '"' => {
                in_token = true;
                while let Some(q) = chars.next() {
                    match q {
                        '"' => break,
                        '\\' => match chars.next() {
                            Some(e @ ('"' | '\\' | '$' | '`')) => current.push(e),
                            Some(other) => {
                                current.push('\\');
                                current.push(other);
                            }
                            None => current.push('\\'),
                        },
                        _ => current.push(q),
                    }
                }
            }
            '\\' => {
                in_token = true;
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            c if c.is_whitespace() => {
                if in_token {
                    args.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            _ => {
                in_token = true;
                current.push(c);
            }
        }
    }
    if in_token {
        args.push(current);
    }
    args
}

/// Quote one word for a POSIX shell. Safe words pass through unchanged.
pub fn shell_quote(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }
    let safe = arg
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "_-./:=@%+,".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

pub fn shell_join<S: AsRef<str>>(args: &[S]) -> String {
    args.iter()
        .map(|a| shell_quote(a.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_args() {
        assert_eq!(split_args(""), Vec::<String>::new());
        assert_eq!(split_args("  --a   b "), vec!["--a", "b"]);
        assert_eq!(
            split_args(r#"--cookies 'my file.txt' --ua "x \"y\"" z\ w"#),
            vec!["--cookies", "my file.txt", "--ua", "x \"y\"", "z w"]
        );
        assert_eq!(split_args("'' x"), vec!["", "x"]);
        assert_eq!(split_args("a'b c'd"), vec!["ab cd"]);
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain-arg_1.0"), "plain-arg_1.0");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote("can't stop"), r"'can'\''t stop'");
    }

    #[test]
    fn quote_then_split_is_lossless() {
        let args = ["can't stop", "a b", "", "$HOME", "back\\slash", "--flag=1"];
        assert_eq!(split_args(&shell_join(&args)), args);
    }

    #[cfg(unix)]
    #[test]
    fn shell_evaluates_quoted_text_back() {
        let quoted = shell_quote("can't stop");
        let out = std::process::Command::new("/bin/sh")
            .arg("-c")
            .arg(format!("printf %s {quoted}"))
            .output()
            .unwrap();
        assert_eq!(String::from_utf8(out.stdout).unwrap(), "can't stop");
    }
}
