use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::error::{JudgeError, Result};
use crate::judge::TestCase;
use crate::limits::ResourceLimits;

/// Where the judge gets a problem's limits and hidden tests from.
pub trait ProblemRepository: Send + Sync {
    fn limits(&self, problem_id: &str) -> Result<ResourceLimits>;

    /// Test cases in evaluation order.
    fn test_cases(&self, problem_id: &str) -> Result<Vec<TestCase>>;
}

/// Where the judge gets submitted source code from.
pub trait SubmissionStore: Send + Sync {
    /// Returns `(language, source_code)`.
    fn source(&self, submission_id: &str) -> Result<(String, String)>;

    fn problem_id(&self, submission_id: &str) -> Result<String>;
}

#[derive(Deserialize)]
struct ProblemFile {
    time_limit_ms: u64,
    memory_limit_mb: u64,
    #[serde(default)]
    testcases: Vec<TestCase>,
}

/// Problems stored as `<dir>/<problem_id>.json`.
///
/// Files are read on every lookup so edits are picked up without a restart.
pub struct FsProblemRepository {
    dir: PathBuf,
}

impl FsProblemRepository {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn load(&self, problem_id: &str) -> Result<ProblemFile> {
        let valid_id = !problem_id.is_empty()
            && problem_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid_id {
            return Err(JudgeError::ProblemNotFound(problem_id.to_string()));
        }

        let path = self.dir.join(format!("{problem_id}.json"));
        if !path.is_file() {
            return Err(JudgeError::ProblemNotFound(problem_id.to_string()));
        }
        read_json(&path)
    }
}

impl ProblemRepository for FsProblemRepository {
    fn limits(&self, problem_id: &str) -> Result<ResourceLimits> {
        let problem = self.load(problem_id)?;
        ResourceLimits::new(problem.time_limit_ms, problem.memory_limit_mb)
    }

    fn test_cases(&self, problem_id: &str) -> Result<Vec<TestCase>> {
        Ok(self.load(problem_id)?.testcases)
    }
}

/// One entry of a submissions file.
#[derive(Deserialize, Debug, Clone)]
pub struct SubmissionRecord {
    pub id: String,
    #[serde(alias = "problemId")]
    pub problem_id: String,
    pub language: String,
    #[serde(alias = "sourceCode")]
    pub source_code: String,
}

/// Submissions loaded from a JSON array, kept in file order.
pub struct JsonSubmissionStore {
    records: Vec<SubmissionRecord>,
    by_id: HashMap<String, usize>,
}

impl JsonSubmissionStore {
    pub fn load(path: &Path) -> Result<Self> {
        let records: Vec<SubmissionRecord> = read_json(path)?;
        Ok(Self::from_records(records))
    }

    /// A later record with a duplicate id shadows the earlier one.
    pub fn from_records(records: Vec<SubmissionRecord>) -> Self {
        let by_id = records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id.clone(), i))
            .collect();
        Self { records, by_id }
    }

    pub fn records(&self) -> &[SubmissionRecord] {
        &self.records
    }

    fn record(&self, submission_id: &str) -> Result<&SubmissionRecord> {
        self.by_id
            .get(submission_id)
            .map(|&i| &self.records[i])
            .ok_or_else(|| JudgeError::SubmissionNotFound(submission_id.to_string()))
    }
}

impl SubmissionStore for JsonSubmissionStore {
    fn source(&self, submission_id: &str) -> Result<(String, String)> {
        let record = self.record(submission_id)?;
        Ok((record.language.clone(), record.source_code.clone()))
    }

    fn problem_id(&self, submission_id: &str) -> Result<String> {
        self.record(submission_id).map(|r| r.problem_id.clone())
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path).map_err(|source| JudgeError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_reader(BufReader::new(file)).map_err(|source| JudgeError::Json {
        path: path.display().to_string(),
        source,
    })
}
