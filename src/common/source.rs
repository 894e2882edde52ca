//! Source files and positions.
//!
//! The lexer tracks line/column positions directly while scanning, so a
//! position is a plain (line, column) pair rather than a byte span. The
//! `SourceFile` registry keeps file contents around for error snippet
//! rendering after tokenization.

/// A line/column position in a source file. Both are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

impl Position {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// A source file registered with the environment.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub name: String,
    pub content: String,
}

impl SourceFile {
    pub fn new(name: String, content: String) -> Self {
        Self { name, content }
    }

    /// The text of the 1-based line `n`, without its trailing newline.
    pub fn line(&self, n: u32) -> Option<&str> {
        self.content.lines().nth(n.saturating_sub(1) as usize)
    }
}

/// Identifies a registered source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileId(pub u32);

/// Owns all source files of a build.
#[derive(Debug, Default)]
pub struct FileSet {
    files: Vec<SourceFile>,
}

impl FileSet {
    pub fn new() -> Self {
        Self { files: Vec::new() }
    }

    pub fn add(&mut self, name: String, content: String) -> FileId {
        let id = FileId(self.files.len() as u32);
        self.files.push(SourceFile::new(name, content));
        id
    }

    pub fn get(&self, id: FileId) -> &SourceFile {
        &self.files[id.0 as usize]
    }

    pub fn by_name(&self, name: &str) -> Option<&SourceFile> {
        self.files.iter().find(|f| f.name == name)
    }
}
