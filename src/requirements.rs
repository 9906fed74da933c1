//! Dependency manifest (`requirements.txt`) parsing.
//!
//! Only as much of the format as the build needs: requirement lines with
//! extras, specifiers and markers, option lines, `-r`/`-c` includes, line
//! continuations and comments. Resolution itself is left to the installer.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// One logical line of a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Requirement(Requirement),
    /// `-r file` / `--requirement file`
    Include(PathBuf),
    /// `-c file` / `--constraint file`
    Constraint(PathBuf),
    /// Any other option line (`--index-url ...`, `-e .`, ...), kept verbatim.
    Option(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub name: String,
    pub extras: Vec<String>,
    /// Version specifier, e.g. `==1.0.0` or `>=2,<3`. Empty when absent.
    pub specifier: String,
    /// Environment marker after `;`, if any.
    pub marker: Option<String>,
    /// Line number in the manifest (1-based).
    pub line: usize,
}

impl Requirement {
    /// Pinned to exactly one version (`==X` without wildcard, or `===X`).
    pub fn is_pinned(&self) -> bool {
        let spec = self.specifier.trim();
        if let Some(version) = spec.strip_prefix("===") {
            return !version.trim().is_empty();
        }
        match spec.strip_prefix("==") {
            Some(version) => {
                let version = version.trim();
                !version.is_empty() && !version.contains('*') && !version.contains(',')
            }
            None => false,
        }
    }

    /// Normalized project name (PEP 503).
    pub fn normalized_name(&self) -> String {
        normalize_name(&self.name)
    }
}

impl std::fmt::Display for Requirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.extras.is_empty() {
            write!(f, "[{}]", self.extras.join(","))?;
        }
        write!(f, "{}", self.specifier)?;
        if let Some(marker) = &self.marker {
            write!(f, "; {}", marker)?;
        }
        Ok(())
    }
}

/// Lowercase and collapse runs of `-`, `_`, `.` into `-`.
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_sep = false;
    for c in name.chars() {
        if matches!(c, '-' | '_' | '.') {
            if !last_sep {
                out.push('-');
            }
            last_sep = true;
        } else {
            out.push(c.to_ascii_lowercase());
            last_sep = false;
        }
    }
    out
}

/// Parse manifest text.
pub fn parse(content: &str) -> Result<Vec<Entry>> {
    let mut entries = Vec::new();
    let mut pending = String::new();
    let mut start_line = 0;

    for (idx, raw) in content.lines().enumerate() {
        if pending.is_empty() {
            start_line = idx + 1;
        }
        if let Some(head) = raw.strip_suffix('\\') {
            pending.push_str(head);
            pending.push(' ');
            continue;
        }
        pending.push_str(raw);
        let logical = std::mem::take(&mut pending);
        if let Some(entry) = parse_line(&logical, start_line)? {
            entries.push(entry);
        }
    }
    if !pending.is_empty() {
        if let Some(entry) = parse_line(&pending, start_line)? {
            entries.push(entry);
        }
    }
    Ok(entries)
}

fn strip_comment(line: &str) -> &str {
    // `#` starts a comment at line start or after whitespace; URL fragments
    // such as `pkg @ https://host/x#sha256=..` are kept.
    let bytes = line.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if *b == b'#' && (i == 0 || bytes[i - 1].is_ascii_whitespace()) {
            return &line[..i];
        }
    }
    line
}

fn parse_line(raw: &str, line: usize) -> Result<Option<Entry>> {
    let text = strip_comment(raw).trim();
    if text.is_empty() {
        return Ok(None);
    }

    if text.starts_with('-') {
        return Ok(Some(parse_option(text)));
    }

    let (body, marker) = match text.split_once(';') {
        Some((body, marker)) => (body.trim(), Some(marker.trim().to_string())),
        None => (text, None),
    };

    let name_end = body
        .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        .unwrap_or(body.len());
    let name = &body[..name_end];
    if name.is_empty() {
        anyhow::bail!("line {}: cannot parse requirement '{}'", line, text);
    }

    let mut rest = body[name_end..].trim_start();
    let mut extras = Vec::new();
    if let Some(after) = rest.strip_prefix('[') {
        let close = after
            .find(']')
            .with_context(|| format!("line {}: unterminated extras in '{}'", line, text))?;
        extras = after[..close]
            .split(',')
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .collect();
        rest = after[close + 1..].trim_start();
    }

    let specifier: String = rest.chars().filter(|c| !c.is_whitespace()).collect();

    Ok(Some(Entry::Requirement(Requirement {
        name: name.to_string(),
        extras,
        specifier,
        marker: marker.filter(|m| !m.is_empty()),
        line,
    })))
}

fn parse_option(text: &str) -> Entry {
    let (flag, value) = match text.split_once(|c: char| c == '=' || c.is_whitespace()) {
        Some((flag, value)) => (flag, value.trim()),
        None => (text, ""),
    };
    match flag {
        "-r" | "--requirement" if !value.is_empty() => Entry::Include(PathBuf::from(value)),
        "-c" | "--constraint" if !value.is_empty() => Entry::Constraint(PathBuf::from(value)),
        _ => Entry::Option(text.to_string()),
    }
}

/// A manifest together with every file it pulls in.
#[derive(Debug, Clone)]
pub struct Manifest {
    /// Files in include order: `(path relative to the manifest dir, bytes)`.
    /// The root manifest comes first.
    pub files: Vec<(String, Vec<u8>)>,
    /// Requirement entries from every file, in order.
    pub requirements: Vec<Requirement>,
}

impl Manifest {
    /// Load a manifest and follow its `-r` / `-c` includes.
    ///
    /// Includes resolve relative to the including file and must stay inside
    /// the manifest's directory, since only that tree is copied ahead of the
    /// dependency install.
    pub fn load(path: &Path) -> Result<Self> {
        let base = path.parent().unwrap_or(Path::new("."));
        let root_name = path
            .file_name()
            .context("manifest path has no file name")?
            .to_string_lossy()
            .into_owned();

        let mut manifest = Manifest {
            files: Vec::new(),
            requirements: Vec::new(),
        };
        manifest.visit(base, PathBuf::from(root_name))?;
        Ok(manifest)
    }

    fn visit(&mut self, base: &Path, rel: PathBuf) -> Result<()> {
        let key = rel.to_string_lossy().into_owned();
        if self.files.iter().any(|(name, _)| *name == key) {
            return Ok(());
        }
        if rel.is_absolute() || rel.components().any(|c| c.as_os_str() == "..") {
            anyhow::bail!(
                "manifest include '{}' escapes the manifest directory",
                rel.display()
            );
        }

        let full = base.join(&rel);
        let bytes = fs::read(&full)
            .with_context(|| format!("Failed to read dependency manifest {}", full.display()))?;
        let text = String::from_utf8_lossy(&bytes).into_owned();
        self.files.push((key, bytes));

        let parent = rel.parent().map(Path::to_path_buf).unwrap_or_default();
        for entry in parse(&text).with_context(|| format!("in {}", full.display()))? {
            match entry {
                Entry::Requirement(req) => self.requirements.push(req),
                Entry::Include(inc) | Entry::Constraint(inc) => {
                    self.visit(base, parent.join(inc))?;
                }
                Entry::Option(_) => {}
            }
        }
        Ok(())
    }

    /// Requirements that are not pinned to a single version.
    pub fn unpinned(&self) -> impl Iterator<Item = &Requirement> {
        self.requirements.iter().filter(|r| !r.is_pinned())
    }

    pub fn relative_paths(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(|(name, _)| name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn requirement(entry: &Entry) -> &Requirement {
        match entry {
            Entry::Requirement(req) => req,
            other => panic!("expected requirement, got {:?}", other),
        }
    }

    #[test]
    fn parses_pinned_requirement() {
        let entries = parse("foo==1.0.0\n").unwrap();
        let req = requirement(&entries[0]);
        assert_eq!(req.name, "foo");
        assert_eq!(req.specifier, "==1.0.0");
        assert!(req.is_pinned());
    }

    #[test]
    fn parses_extras_and_markers() {
        let entries = parse("aiogram[fast, redis] >= 3.0 ; python_version >= '3.9'").unwrap();
        let req = requirement(&entries[0]);
        assert_eq!(req.name, "aiogram");
        assert_eq!(req.extras, vec!["fast", "redis"]);
        assert_eq!(req.specifier, ">=3.0");
        assert_eq!(req.marker.as_deref(), Some("python_version >= '3.9'"));
        assert!(!req.is_pinned());
    }

    #[test]
    fn comments_blank_lines_and_continuations() {
        let content = "# header\n\nfoo==1.0 # trailing\nbar \\\n  ==2.0\n";
        let entries = parse(content).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(requirement(&entries[0]).specifier, "==1.0");
        let bar = requirement(&entries[1]);
        assert_eq!(bar.name, "bar");
        assert_eq!(bar.specifier, "==2.0");
        assert_eq!(bar.line, 4);
    }

    #[test]
    fn option_lines() {
        let entries =
            parse("-r base.txt\n--constraint=c.txt\n--index-url https://pypi.org/simple\n")
                .unwrap();
        assert_eq!(entries[0], Entry::Include(PathBuf::from("base.txt")));
        assert_eq!(entries[1], Entry::Constraint(PathBuf::from("c.txt")));
        assert!(matches!(entries[2], Entry::Option(_)));
    }

    #[test]
    fn pin_detection() {
        let pinned = |spec: &str| {
            Requirement {
                name: "x".into(),
                extras: vec![],
                specifier: spec.into(),
                marker: None,
                line: 1,
            }
            .is_pinned()
        };
        assert!(pinned("==1.0.0"));
        assert!(pinned("===1.0"));
        assert!(!pinned("==1.*"));
        assert!(!pinned(">=1.0"));
        assert!(!pinned("==1.0,!=1.0.1"));
        assert!(!pinned(""));
    }

    #[test]
    fn normalizes_names() {
        assert_eq!(normalize_name("Python_Dotenv"), "python-dotenv");
        assert_eq!(normalize_name("a.-_b"), "a-b");
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse("==1.0\n").is_err());
    }

    #[test]
    fn loads_includes() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("requirements.txt"), "-r base.txt\nfoo==1.0.0\n").unwrap();
        fs::write(dir.path().join("base.txt"), "bar>=2\n").unwrap();

        let manifest = Manifest::load(&dir.path().join("requirements.txt")).unwrap();
        let files: Vec<&str> = manifest.relative_paths().collect();
        assert_eq!(files, vec!["requirements.txt", "base.txt"]);
        assert_eq!(manifest.requirements.len(), 2);
        let unpinned: Vec<_> = manifest.unpinned().map(|r| r.name.as_str()).collect();
        assert_eq!(unpinned, vec!["bar"]);
    }

    #[test]
    fn include_cycles_terminate() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("requirements.txt"), "-r other.txt\n").unwrap();
        fs::write(dir.path().join("other.txt"), "-r requirements.txt\nfoo==1\n").unwrap();
        let manifest = Manifest::load(&dir.path().join("requirements.txt")).unwrap();
        assert_eq!(manifest.files.len(), 2);
    }

    #[test]
    fn include_outside_directory_is_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("requirements.txt"), "-r ../escape.txt\n").unwrap();
        assert!(Manifest::load(&dir.path().join("requirements.txt")).is_err());
    }
}
