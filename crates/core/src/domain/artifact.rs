use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    #[default]
    Python,
    Shell,
    Bash,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Shell => "shell",
            Self::Bash => "bash",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "python" | "python3" | "py" => Some(Self::Python),
            "shell" | "sh" => Some(Self::Shell),
            "bash" => Some(Self::Bash),
            _ => None,
        }
    }

    pub fn script_name(&self) -> &'static str {
        match self {
            Self::Python => "main.py",
            Self::Shell | Self::Bash => "main.sh",
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file staged into the sandbox directory before the artifact runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct ArtifactFile {
    pub name: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing)]
    #[schema(ignore)]
    pub contents: Vec<u8>,
}

impl ArtifactFile {
    pub fn new(name: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        let contents = contents.into();
        Self {
            name: name.into(),
            size_bytes: contents.len() as u64,
            contents,
        }
    }
}

/// Code produced by the code generator. Opaque to everything except the
/// sandbox, which runs it without looking inside.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct GeneratedArtifact {
    pub code: String,
    pub language: Language,
    pub expected_outputs: Vec<String>,
    pub inputs: Vec<ArtifactFile>,
}

impl GeneratedArtifact {
    pub fn new(code: impl Into<String>, language: Language) -> Self {
        Self {
            code: code.into(),
            language,
            expected_outputs: Vec::new(),
            inputs: Vec::new(),
        }
    }

    pub fn with_expected_output(mut self, name: impl Into<String>) -> Self {
        self.expected_outputs.push(name.into());
        self
    }

    pub fn with_input(mut self, file: ArtifactFile) -> Self {
        self.inputs.retain(|f| f.name != file.name);
        self.inputs.push(file);
        self
    }
}

/// True if `name` is a bare file name that cannot escape a directory.
pub fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ExitStatus {
    Code(i32),
    Signal(i32),
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, Self::Code(0))
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Code(code) => write!(f, "exit code {}", code),
            Self::Signal(signal) => write!(f, "signal {}", signal),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    WallTime,
    CpuTime,
    Memory,
    FileSize,
}

impl LimitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WallTime => "wall_time",
            Self::CpuTime => "cpu_time",
            Self::Memory => "memory",
            Self::FileSize => "file_size",
        }
    }
}

impl std::fmt::Display for LimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file the artifact left behind in its scoped directory.
///
/// Small files carry their bytes. Files above the collection cap are moved
/// out of the scoped directory and referenced by path instead.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct ProducedFile {
    pub name: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing)]
    #[schema(ignore)]
    pub content: Option<Vec<u8>>,
    pub reference: Option<String>,
}

impl ProducedFile {
    pub fn inline(name: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            size_bytes: content.len() as u64,
            content: Some(content),
            reference: None,
        }
    }

    pub fn referenced(name: impl Into<String>, size_bytes: u64, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size_bytes,
            content: None,
            reference: Some(path.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct ExecutionResult {
    pub exit_status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub produced_files: Vec<ProducedFile>,
    pub missing_outputs: Vec<String>,
    pub duration_ms: u64,
    pub limit_exceeded: bool,
    pub limit: Option<LimitKind>,
}

impl ExecutionResult {
    /// Exited zero without tripping a limit.
    pub fn succeeded(&self) -> bool {
        self.exit_status.success() && !self.limit_exceeded
    }

    pub fn file(&self, name: &str) -> Option<&ProducedFile> {
        self.produced_files.iter().find(|f| f.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_parse() {
        assert_eq!(Language::parse("Python3"), Some(Language::Python));
        assert_eq!(Language::parse("sh"), Some(Language::Shell));
        assert_eq!(Language::parse("cobol"), None);
        assert_eq!(Language::Bash.script_name(), "main.sh");
    }

    #[test]
    fn test_plain_file_names() {
        assert!(is_plain_file_name("Financial_Report_20240101_120000.xlsx"));
        assert!(!is_plain_file_name("../etc/passwd"));
        assert!(!is_plain_file_name("out/report.xlsx"));
        assert!(!is_plain_file_name(".."));
        assert!(!is_plain_file_name(""));
    }

    #[test]
    fn test_with_input_replaces_same_name() {
        let artifact = GeneratedArtifact::new("print(1)", Language::Python)
            .with_input(ArtifactFile::new("data.json", "{}"))
            .with_input(ArtifactFile::new("data.json", "{\"a\":1}"));
        assert_eq!(artifact.inputs.len(), 1);
        assert_eq!(artifact.inputs[0].size_bytes, 7);
    }

    #[test]
    fn test_execution_result_success_requires_no_limit() {
        let mut result = ExecutionResult {
            exit_status: ExitStatus::Code(0),
            stdout: String::new(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            produced_files: vec![ProducedFile::inline("a.txt", b"hi".to_vec())],
            missing_outputs: Vec::new(),
            duration_ms: 5,
            limit_exceeded: false,
            limit: None,
        };
        assert!(result.succeeded());
        assert_eq!(result.file("a.txt").unwrap().size_bytes, 2);

        result.limit_exceeded = true;
        result.limit = Some(LimitKind::WallTime);
        assert!(!result.succeeded());
    }

    #[test]
    fn test_produced_file_bytes_not_serialized() {
        let file = ProducedFile::inline("a.txt", b"secret".to_vec());
        let json = serde_json::to_value(&file).unwrap();
        assert!(json.get("content").is_none());
        assert_eq!(json["size_bytes"], 6);
    }
}
