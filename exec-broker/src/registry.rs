//! Runner registry: the fixed table mapping a language identifier to the
//! descriptor that says how to compile and run it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use which::which;

use crate::{error::Error, languages, Result};

/// How a language's source becomes a running program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationKind {
    Interpreted,
    Compiled,
    /// Static content; echoed back by the caller, never executed
    Markup,
}

/// A program plus arguments. Arguments may contain the placeholders
/// `{source}`, `{artifact}`, `{workdir}` and `{memory_mb}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandTemplate {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub(crate) fn render(&self, vars: &TemplateVars<'_>) -> (String, Vec<String>) {
        let program = vars.expand(&self.program);
        let args = self.args.iter().map(|arg| vars.expand(arg)).collect();
        (program, args)
    }
}

pub(crate) struct TemplateVars<'a> {
    pub source: &'a Path,
    pub artifact: &'a Path,
    pub workdir: &'a Path,
    pub memory_mb: u64,
}

impl TemplateVars<'_> {
    fn expand(&self, raw: &str) -> String {
        if !raw.contains('{') {
            return raw.to_string();
        }
        raw.replace("{source}", &self.source.to_string_lossy())
            .replace("{artifact}", &self.artifact.to_string_lossy())
            .replace("{workdir}", &self.workdir.to_string_lossy())
            .replace("{memory_mb}", &self.memory_mb.to_string())
    }
}

fn default_true() -> bool {
    true
}

/// How to compile and run one language
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageDescriptor {
    pub id: String,
    pub kind: InvocationKind,
    /// File name the source is written to inside the working area
    #[serde(default)]
    pub source_file: String,
    /// File the compile step must produce
    #[serde(default)]
    pub artifact: Option<String>,
    #[serde(default)]
    pub compile: Option<CommandTemplate>,
    #[serde(default)]
    pub run: Option<CommandTemplate>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Binaries that must be on PATH for this language to work
    #[serde(default)]
    pub required_tools: Vec<String>,
    /// Apply the memory ceiling as RLIMIT_AS. Runtimes that reserve large
    /// virtual ranges up front (JVM, V8) take the ceiling as a heap flag.
    #[serde(default = "default_true")]
    pub limit_address_space: bool,
    #[serde(default = "default_true")]
    pub allow_empty_source: bool,
}

impl LanguageDescriptor {
    pub fn interpreted(id: &str, source_file: &str, run: CommandTemplate) -> Self {
        Self {
            id: id.to_string(),
            kind: InvocationKind::Interpreted,
            source_file: source_file.to_string(),
            artifact: None,
            compile: None,
            required_tools: vec![run.program.clone()],
            run: Some(run),
            enabled: true,
            limit_address_space: true,
            allow_empty_source: true,
        }
    }

    pub fn compiled(
        id: &str,
        source_file: &str,
        artifact: &str,
        compile: CommandTemplate,
        run: CommandTemplate,
    ) -> Self {
        let mut required_tools = vec![compile.program.clone()];
        if !run.program.starts_with("./") && !run.program.contains('{') {
            required_tools.push(run.program.clone());
        }
        Self {
            id: id.to_string(),
            kind: InvocationKind::Compiled,
            source_file: source_file.to_string(),
            artifact: Some(artifact.to_string()),
            compile: Some(compile),
            run: Some(run),
            enabled: true,
            required_tools,
            limit_address_space: true,
            allow_empty_source: true,
        }
    }

    pub fn markup(id: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: InvocationKind::Markup,
            source_file: String::new(),
            artifact: None,
            compile: None,
            run: None,
            enabled: true,
            required_tools: Vec::new(),
            limit_address_space: false,
            allow_empty_source: true,
        }
    }

    pub fn without_address_space_limit(mut self) -> Self {
        self.limit_address_space = false;
        self
    }

    pub fn is_executable(&self) -> bool {
        self.kind != InvocationKind::Markup
    }

    /// Whether every required tool resolves on the host PATH
    pub fn toolchain_available(&self) -> bool {
        self.required_tools.iter().all(|tool| which(tool).is_ok())
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::Config("language id must not be empty".to_string()));
        }
        let problem = match self.kind {
            InvocationKind::Markup => None,
            _ if self.source_file.is_empty() => Some("missing source_file"),
            _ if self.run.is_none() => Some("missing run command"),
            InvocationKind::Interpreted if self.compile.is_some() => {
                Some("interpreted languages take no compile command")
            }
            InvocationKind::Compiled if self.compile.is_none() => Some("missing compile command"),
            InvocationKind::Compiled if self.artifact.is_none() => Some("missing artifact"),
            _ => None,
        };
        match problem {
            Some(problem) => Err(Error::Config(format!("language {}: {}", self.id, problem))),
            None => Ok(()),
        }
    }
}

/// Read-only lookup table, built once at startup
#[derive(Debug, Clone, Default)]
pub struct RunnerRegistry {
    descriptors: HashMap<String, Arc<LanguageDescriptor>>,
}

impl RunnerRegistry {
    /// The languages served out of the box
    pub fn builtin() -> Self {
        let descriptors = languages::builtin()
            .into_iter()
            .map(|descriptor| (descriptor.id.to_lowercase(), Arc::new(descriptor)))
            .collect();
        Self { descriptors }
    }

    pub fn from_descriptors<I>(descriptors: I) -> Result<Self>
    where
        I: IntoIterator<Item = LanguageDescriptor>,
    {
        let mut registry = Self::default();
        for descriptor in descriptors {
            registry.insert(descriptor)?;
        }
        Ok(registry)
    }

    /// Built-in table, then configured descriptors replacing or extending
    /// it, then the disabled list applied on top.
    pub fn with_overrides(
        overrides: &[LanguageDescriptor],
        disabled: &[String],
    ) -> Result<Self> {
        let mut registry = Self::builtin();
        for descriptor in overrides {
            debug!("Registering configured language: {}", descriptor.id);
            registry.insert(descriptor.clone())?;
        }
        for id in disabled {
            let key = id.to_lowercase();
            let Some(descriptor) = registry.descriptors.get_mut(&key) else {
                return Err(Error::Config(format!("cannot disable unknown language {}", id)));
            };
            let mut updated = (**descriptor).clone();
            updated.enabled = false;
            *descriptor = Arc::new(updated);
            info!("Language disabled by configuration: {}", key);
        }
        Ok(registry)
    }

    fn insert(&mut self, descriptor: LanguageDescriptor) -> Result<()> {
        descriptor.validate()?;
        self.descriptors
            .insert(descriptor.id.to_lowercase(), Arc::new(descriptor));
        Ok(())
    }

    /// Exact, case-insensitive lookup
    pub fn lookup(&self, identifier: &str) -> Result<Arc<LanguageDescriptor>> {
        self.descriptors
            .get(&identifier.to_lowercase())
            .cloned()
            .ok_or_else(|| Error::UnsupportedLanguage(identifier.to_string()))
    }

    /// All descriptors, sorted by identifier
    pub fn languages(&self) -> Vec<Arc<LanguageDescriptor>> {
        let mut all: Vec<_> = self.descriptors.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}
