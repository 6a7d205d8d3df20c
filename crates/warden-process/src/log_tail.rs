use std::path::Path;

use crate::ProcessError;

/// Returns the last `lines` lines of the console log, or the whole file when it is shorter.
pub async fn scan_log(path: &Path, lines: usize) -> Result<String, ProcessError> {
    if lines == 0 {
        return Err(ProcessError::InvalidArgument(
            "line count must be positive".to_string(),
        ));
    }

    let raw = tokio::fs::read(path)
        .await
        .map_err(|e| ProcessError::io(format!("open log file {}", path.display()), e))?;
    Ok(tail_lines(&String::from_utf8_lossy(&raw), lines))
}

pub fn tail_lines(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    if all.len() <= lines {
        return text.to_string();
    }
    all[all.len() - lines..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_log_is_returned_unchanged() {
        let text = "one\ntwo\nthree\n";
        assert_eq!(tail_lines(text, 5), text);
    }

    #[test]
    fn long_log_keeps_last_lines() {
        let text = (1..=1000)
            .map(|i| format!("line {i}"))
            .collect::<Vec<_>>()
            .join("\n");
        let tail = tail_lines(&text, 5);
        assert_eq!(tail.lines().count(), 5);
        assert_eq!(tail, "line 996\nline 997\nline 998\nline 999\nline 1000");
    }

    #[tokio::test]
    async fn zero_lines_is_rejected() {
        let err = scan_log(Path::new("/nonexistent"), 0).await.unwrap_err();
        assert!(matches!(err, ProcessError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = scan_log(&dir.path().join("console.log"), 3)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Io { .. }));
    }

    #[tokio::test]
    async fn reads_file_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("console.log");
        std::fs::write(&path, "a\nb\nc\nd\n").unwrap();
        assert_eq!(scan_log(&path, 2).await.unwrap(), "c\nd");
    }
}
