use std::collections::{BTreeMap, HashMap};

use crate::config::LanguageConfig;
use crate::error::{JudgeError, Result};
use crate::sandbox::{
    COMPILE_ERROR_FILE, COMPILE_OUTPUT_FILE, ERROR_FILE, INPUT_FILE, OUTPUT_FILE,
};

/// How to build and run one language inside the sandbox.
///
/// Profiles are plain data; the only behavior is turning the templates into
/// shell command lines with the workspace's fixed redirections appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageProfile {
    name: String,
    source_file: String,
    artifact: Option<String>,
    image: String,
    compile: Option<Vec<String>>,
    run: Vec<String>,
}

impl LanguageProfile {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source_file(&self) -> &str {
        &self.source_file
    }

    pub fn artifact(&self) -> Option<&str> {
        self.artifact.as_deref()
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn has_compile_step(&self) -> bool {
        self.compile.is_some()
    }

    /// What the run step executes: the compiled artifact if there is one,
    /// the source file otherwise.
    pub fn program(&self) -> &str {
        self.artifact.as_deref().unwrap_or(&self.source_file)
    }

    /// Compile command line, or `None` for interpreted languages.
    ///
    /// Compiler stdout/stderr land in the fixed compile output files.
    pub fn compile_command(&self, source_file: &str, artifact: &str) -> Option<String> {
        let template = self.compile.as_ref()?;
        let mut mapping = HashMap::<&str, &str>::new();
        mapping.insert("%INPUT%", source_file);
        mapping.insert("%OUTPUT%", artifact);
        let command = apply_template_and_join(template, &mapping);
        Some(format!(
            "{command} > {COMPILE_OUTPUT_FILE} 2> {COMPILE_ERROR_FILE}"
        ))
    }

    /// Run command line reading stdin from the fixed input file and writing
    /// stdout/stderr to the fixed output files.
    ///
    /// `%MEMORY_MB%` lets runtimes with their own heap cap size it to the
    /// limit.
    pub fn run_command(&self, program: &str, memory_limit_mb: u64) -> String {
        let memory_limit_mb = memory_limit_mb.to_string();
        let mut mapping = HashMap::<&str, &str>::new();
        mapping.insert("%PROGRAM%", program);
        mapping.insert("%MEMORY_MB%", &memory_limit_mb);
        let command = apply_template_and_join(&self.run, &mapping);
        format!("{command} < {INPUT_FILE} > {OUTPUT_FILE} 2> {ERROR_FILE}")
    }
}

impl TryFrom<LanguageConfig> for LanguageProfile {
    type Error = JudgeError;

    fn try_from(config: LanguageConfig) -> Result<Self> {
        if config.name.is_empty() || config.source_file.is_empty() {
            return Err(JudgeError::Config(
                "language name and source_file must not be empty".to_string(),
            ));
        }
        if config.run.is_empty() {
            return Err(JudgeError::Config(format!(
                "language `{}` has an empty run command",
                config.name
            )));
        }
        if config.compile.is_some() && config.artifact.is_none() {
            return Err(JudgeError::Config(format!(
                "language `{}` compiles but names no artifact",
                config.name
            )));
        }
        Ok(Self {
            name: config.name,
            source_file: config.source_file,
            artifact: config.artifact,
            image: config.image,
            compile: config.compile,
            run: config.run,
        })
    }
}

/// Immutable language table, built once at start-up and shared by every
/// judge.
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    profiles: BTreeMap<String, LanguageProfile>,
    aliases: HashMap<String, String>,
}

impl LanguageRegistry {
    /// Python, C/C++ and Java.
    pub fn builtin() -> Self {
        let profiles = [python(), c_cpp(), java()]
            .into_iter()
            .map(|p| (p.name.clone(), p))
            .collect();
        let aliases = [
            ("py", "python"),
            ("python3", "python"),
            ("cpp", "c_cpp"),
            ("c++", "c_cpp"),
            ("c", "c_cpp"),
        ]
        .into_iter()
        .map(|(alias, name)| (alias.to_string(), name.to_string()))
        .collect();

        Self { profiles, aliases }
    }

    /// Built-in profiles plus configured ones; a configured language with a
    /// built-in name replaces it.
    pub fn with_languages(languages: Vec<LanguageConfig>) -> Result<Self> {
        let mut registry = Self::builtin();
        for config in languages {
            let profile = LanguageProfile::try_from(config)?;
            log::debug!("Registered language {}", profile.name);
            registry.aliases.remove(&profile.name);
            registry.profiles.insert(profile.name.clone(), profile);
        }
        Ok(registry)
    }

    pub fn get(&self, language: &str) -> Result<&LanguageProfile> {
        let name = self
            .aliases
            .get(language)
            .map(String::as_str)
            .unwrap_or(language);
        self.profiles
            .get(name)
            .ok_or_else(|| JudgeError::UnsupportedLanguage(language.to_string()))
    }

    pub fn profiles(&self) -> impl Iterator<Item = &LanguageProfile> {
        self.profiles.values()
    }
}

fn python() -> LanguageProfile {
    LanguageProfile {
        name: "python".to_string(),
        source_file: "main.py".to_string(),
        artifact: None,
        image: "judger-python:v1".to_string(),
        compile: None,
        run: vec!["python3".to_string(), "%PROGRAM%".to_string()],
    }
}

fn c_cpp() -> LanguageProfile {
    LanguageProfile {
        name: "c_cpp".to_string(),
        source_file: "main.cpp".to_string(),
        artifact: Some("a.out".to_string()),
        image: "judger-gcc:v1".to_string(),
        compile: Some(
            [
                "g++",
                "%INPUT%",
                "-o",
                "%OUTPUT%",
                "-O2",
                "-std=c++17",
                "-Wall",
                "-Wextra",
                "-DONLINE_JUDGE",
                "-static",
            ]
            .map(String::from)
            .to_vec(),
        ),
        run: vec!["./%PROGRAM%".to_string()],
    }
}

// The submitted source must define `public class Main`. The JVM reserves far
// more address space than it touches, so it needs a memory cgroup or docker
// rather than `RLIMIT_AS`.
fn java() -> LanguageProfile {
    LanguageProfile {
        name: "java".to_string(),
        source_file: "Main.java".to_string(),
        artifact: Some("Main".to_string()),
        image: "judger-java:v1".to_string(),
        compile: Some(
            ["javac", "-encoding", "UTF-8", "%INPUT%"]
                .map(String::from)
                .to_vec(),
        ),
        run: [
            "java",
            "-Xss64m",
            "-Xmx%MEMORY_MB%m",
            "-XX:ReservedCodeCacheSize=32m",
            "-XX:CompressedClassSpaceSize=64m",
            "-XX:+UseSerialGC",
            "-cp",
            ".",
            "%PROGRAM%",
        ]
            .map(String::from)
            .to_vec(),
    }
}

/// Applies template substitutions to command arguments and joins them
fn apply_template_and_join(cmd_template: &[String], mapping: &HashMap<&str, &str>) -> String {
    let replaced: Vec<String> = cmd_template
        .iter()
        .map(|s| {
            let mut t = s.clone();
            for (k, v) in mapping.iter() {
                t = t.replace(k, v);
            }
            t
        })
        .collect();

    replaced.join(" ")
}
