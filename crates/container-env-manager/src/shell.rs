//! POSIX shell quoting for generated command lines.

/// Quote `arg` so a POSIX shell reads it back as a single word.
///
/// Words made only of safe characters are returned unchanged.
pub fn quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Join `args` into one shell command line.
pub fn join<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    args.into_iter()
        .map(|a| quote(a.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_words_unchanged() {
        assert_eq!(quote("--opset"), "--opset");
        assert_eq!(quote("/ws/onnx_opset13/model.onnx"), "/ws/onnx_opset13/model.onnx");
    }

    #[test]
    fn test_spaces_and_quotes_are_escaped() {
        assert_eq!(quote("a b"), "'a b'");
        assert_eq!(quote("it's"), r"'it'\''s'");
        assert_eq!(quote(""), "''");
    }

    #[test]
    fn test_join() {
        assert_eq!(join(["bash", "-c", "echo hi"]), "bash -c 'echo hi'");
    }
}
