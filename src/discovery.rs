//! Work unit discovery from an input directory.
//!
//! A [`DiscoveryRule`] describes the naming convention of the input
//! collaborator: one unit per matching file, one per `R1`/`R2` read pair, or
//! one per subject directory. Discovery is non-recursive, ignores hidden
//! entries and always returns units sorted by key so dispatch order is
//! reproducible across invocations.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::DiscoveryError;
use crate::state_machine::{Resources, WorkUnit};

/// Upper bound on matcher steps per [`glob_match`] call. Patterns come from
/// config files, so a pathological one must not stall discovery.
const MAX_MATCH_STEPS: usize = 100_000;

/// Upper bound on the alternatives a `{a,b}` pattern expands to.
const MAX_BRACE_ALTERNATIVES: usize = 256;

/// Naming convention used to turn directory entries into work units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DiscoveryRule {
    /// One unit per regular file whose name matches `pattern`.
    Files {
        #[serde(default = "default_pattern")]
        pattern: String,
        #[serde(default)]
        shared_pattern: Option<String>,
    },
    /// One unit per complete `first`/`second` pair of matching files.
    Pairs {
        #[serde(default = "default_pattern")]
        pattern: String,
        #[serde(default = "default_first_mate")]
        first: String,
        #[serde(default = "default_second_mate")]
        second: String,
        #[serde(default)]
        shared_pattern: Option<String>,
    },
    /// One unit per sub-directory, optionally requiring a config file inside.
    Directories {
        #[serde(default)]
        config_pattern: Option<String>,
        #[serde(default)]
        shared_pattern: Option<String>,
    },
}

fn default_pattern() -> String {
    "*".to_string()
}

fn default_first_mate() -> String {
    "R1".to_string()
}

fn default_second_mate() -> String {
    "R2".to_string()
}

impl Default for DiscoveryRule {
    fn default() -> Self {
        DiscoveryRule::Files {
            pattern: default_pattern(),
            shared_pattern: None,
        }
    }
}

impl DiscoveryRule {
    pub fn shared_pattern(&self) -> Option<&str> {
        match self {
            DiscoveryRule::Files { shared_pattern, .. }
            | DiscoveryRule::Pairs { shared_pattern, .. }
            | DiscoveryRule::Directories { shared_pattern, .. } => shared_pattern.as_deref(),
        }
    }

    /// Replaces the primary pattern. For `directories` this is the pattern
    /// of the per-subject config file.
    pub fn with_pattern(self, new: String) -> Self {
        match self {
            DiscoveryRule::Files { shared_pattern, .. } => DiscoveryRule::Files {
                pattern: new,
                shared_pattern,
            },
            DiscoveryRule::Pairs {
                first,
                second,
                shared_pattern,
                ..
            } => DiscoveryRule::Pairs {
                pattern: new,
                first,
                second,
                shared_pattern,
            },
            DiscoveryRule::Directories { shared_pattern, .. } => DiscoveryRule::Directories {
                config_pattern: Some(new),
                shared_pattern,
            },
        }
    }

    /// Rejects patterns that could never match anything useful.
    pub fn validate(&self) -> Result<(), DiscoveryError> {
        let mut patterns = vec![];
        match self {
            DiscoveryRule::Files { pattern, .. } => patterns.push(pattern.as_str()),
            DiscoveryRule::Pairs {
                pattern,
                first,
                second,
                ..
            } => {
                patterns.push(pattern.as_str());
                if first.is_empty() || second.is_empty() || first == second {
                    return Err(DiscoveryError::InvalidPattern(format!("{first}/{second}")));
                }
            }
            DiscoveryRule::Directories { config_pattern, .. } => {
                patterns.extend(config_pattern.as_deref());
            }
        }
        patterns.extend(self.shared_pattern());
        for pattern in patterns {
            if pattern.is_empty()
                || pattern.contains('/')
                || !braces_balanced(pattern)
                || expand_braces(pattern).len() >= MAX_BRACE_ALTERNATIVES
            {
                return Err(DiscoveryError::InvalidPattern(pattern.to_string()));
            }
        }
        Ok(())
    }
}

/// How a discovered input set becomes a [`WorkUnit`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTemplate {
    /// Argument vector with `{placeholder}` substitutions.
    #[serde(default)]
    pub command: Vec<String>,
    /// Output directory template; `{key}` and `{session}` are expanded.
    #[serde(default)]
    pub output_dir: Option<String>,
    /// Declared outputs relative to the output directory; `{key}` is expanded.
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub params: IndexMap<String, String>,
    #[serde(default)]
    pub cores: Option<u32>,
    #[serde(default)]
    pub memory: Option<String>,
}

/// Where relative paths produced by a template are anchored.
#[derive(Debug, Clone)]
pub struct UnitContext<'a> {
    pub session: &'a str,
    /// Base for a relative `output_dir` template.
    pub base_dir: &'a Path,
    /// Used when the template has no `output_dir`; the key is appended.
    pub default_output_root: &'a Path,
}

impl JobTemplate {
    pub fn instantiate(
        &self,
        key: &str,
        inputs: Vec<PathBuf>,
        shared_inputs: Vec<PathBuf>,
        ctx: &UnitContext<'_>,
    ) -> WorkUnit {
        let output_dir = match &self.output_dir {
            Some(template) => {
                let rendered = template
                    .replace("{key}", key)
                    .replace("{session}", ctx.session);
                ctx.base_dir.join(rendered)
            }
            None => ctx.default_output_root.join(key),
        };
        WorkUnit {
            key: key.to_string(),
            inputs,
            shared_inputs,
            output_dir,
            command: self.command.clone(),
            params: self.params.clone(),
            outputs: self.outputs.iter().map(|o| o.replace("{key}", key)).collect(),
            resources: Resources {
                cores: self.cores,
                memory: self.memory.clone(),
            },
        }
    }
}

/// Enumerates the work units below `root`, sorted by key.
pub fn discover(
    root: &Path,
    rule: &DiscoveryRule,
    template: &JobTemplate,
    ctx: &UnitContext<'_>,
) -> Result<Vec<WorkUnit>, DiscoveryError> {
    rule.validate()?;
    let entries = list_entries(root)?;

    let shared: Vec<PathBuf> = match rule.shared_pattern() {
        Some(pattern) => entries
            .iter()
            .filter(|e| !e.is_dir && glob_match(pattern, &e.name))
            .map(|e| e.path.clone())
            .collect(),
        None => Vec::new(),
    };
    let is_shared = |e: &Entry| {
        rule.shared_pattern()
            .is_some_and(|p| !e.is_dir && glob_match(p, &e.name))
    };

    // key -> inputs, ordered by key
    let mut found: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    let mut insert = |key: String, inputs: Vec<PathBuf>| -> Result<(), DiscoveryError> {
        if let Some(existing) = found.get(&key) {
            return Err(DiscoveryError::DuplicateKey {
                key,
                first: existing[0].clone(),
                second: inputs[0].clone(),
            });
        }
        found.insert(key, inputs);
        Ok(())
    };

    match rule {
        DiscoveryRule::Files { pattern, .. } => {
            for entry in entries.iter().filter(|e| !e.is_dir && !is_shared(*e)) {
                if glob_match(pattern, &entry.name) {
                    insert(file_stem(&entry.name), vec![entry.path.clone()])?;
                }
            }
        }
        DiscoveryRule::Pairs {
            pattern,
            first,
            second,
            ..
        } => {
            let names: BTreeMap<&str, &Entry> = entries
                .iter()
                .filter(|e| !e.is_dir && !is_shared(*e) && glob_match(pattern, &e.name))
                .map(|e| (e.name.as_str(), e))
                .collect();
            let mut paired = Vec::new();
            for (name, entry) in &names {
                let Some((prefix, suffix)) = name.rsplit_once(first.as_str()) else {
                    continue;
                };
                let mate_name = format!("{prefix}{second}{suffix}");
                match names.get(mate_name.as_str()) {
                    Some(mate) => {
                        paired.push(mate_name.clone());
                        let key = pair_key(prefix, name);
                        insert(key, vec![entry.path.clone(), mate.path.clone()])?;
                    }
                    None => warn!(file = %name, "Skipping unpaired input, no {second} mate"),
                }
            }
            for name in names.keys() {
                if name.contains(second.as_str())
                    && !name.contains(first.as_str())
                    && !paired.iter().any(|p| p.as_str() == *name)
                {
                    warn!(file = %name, "Skipping unpaired input, no {first} mate");
                }
            }
        }
        DiscoveryRule::Directories { config_pattern, .. } => {
            for entry in entries.iter().filter(|e| e.is_dir) {
                let mut inputs = vec![entry.path.clone()];
                if let Some(pattern) = config_pattern {
                    let config = list_entries(&entry.path)?
                        .into_iter()
                        .find(|e| !e.is_dir && glob_match(pattern, &e.name));
                    match config {
                        Some(config) => inputs.push(config.path),
                        None => {
                            warn!(subject = %entry.name, "Skipping subject without config file matching {pattern}");
                            continue;
                        }
                    }
                }
                insert(entry.name.clone(), inputs)?;
            }
        }
    }

    debug!(root = %root.display(), units = found.len(), "Discovered work units");
    Ok(found
        .into_iter()
        .map(|(key, inputs)| template.instantiate(&key, inputs, shared.clone(), ctx))
        .collect())
}

struct Entry {
    name: String,
    path: PathBuf,
    is_dir: bool,
}

/// Non-hidden entries of `dir`, sorted by name.
fn list_entries(dir: &Path) -> Result<Vec<Entry>, DiscoveryError> {
    let unreadable = |source| DiscoveryError::Unreadable {
        path: dir.to_path_buf(),
        source,
    };
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).map_err(unreadable)? {
        let entry = entry.map_err(unreadable)?;
        let path = entry.path();
        let name = entry
            .file_name()
            .into_string()
            .map_err(|_| DiscoveryError::NonUtf8Name(path.clone()))?;
        if name.starts_with('.') {
            continue;
        }
        // follows symlinks so linked data directories count
        let is_dir = fs::metadata(&path).map_err(unreadable)?.is_dir();
        entries.push(Entry { name, path, is_dir });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

/// `chr01.vcf.gz` -> `chr01`
fn file_stem(name: &str) -> String {
    match name.split_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => name.to_string(),
    }
}

/// `sample_01_R1.fastq.gz` with prefix `sample_01_` -> `sample_01`
fn pair_key(prefix: &str, first_name: &str) -> String {
    let trimmed = prefix.trim_end_matches(['_', '-', '.']);
    if trimmed.is_empty() {
        file_stem(first_name)
    } else {
        trimmed.to_string()
    }
}

fn braces_balanced(pattern: &str) -> bool {
    let mut depth = 0i32;
    for c in pattern.chars() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}

/// Shell-style glob match of a whole file name.
///
/// Supports `*`, `?`, `[abc]`, `[a-z]`, `[!abc]` and `{a,b}` alternatives.
/// Work is bounded: a pattern that exceeds [`MAX_MATCH_STEPS`] is a non-match.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    let name: Vec<char> = name.chars().collect();
    let steps = Cell::new(0);
    expand_braces(pattern).iter().any(|alt| {
        let pat: Vec<char> = alt.chars().collect();
        match_chars(&pat, &name, &steps)
    })
}

/// Expands `{a,b}` alternatives, keeping at most [`MAX_BRACE_ALTERNATIVES`].
fn expand_braces(pattern: &str) -> Vec<String> {
    let Some(open) = pattern.find('{') else {
        return vec![pattern.to_string()];
    };
    let mut depth = 0;
    let mut close = None;
    for (i, c) in pattern[open..].char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    close = Some(open + i);
                    break;
                }
            }
            _ => {}
        }
    }
    let Some(close) = close else {
        return vec![pattern.to_string()];
    };

    let (prefix, body, suffix) = (&pattern[..open], &pattern[open + 1..close], &pattern[close + 1..]);
    let mut alternatives = Vec::new();
    let mut current = String::new();
    let mut depth = 0;
    for c in body.chars() {
        match c {
            ',' if depth == 0 => alternatives.push(std::mem::take(&mut current)),
            '{' => {
                depth += 1;
                current.push(c);
            }
            '}' => {
                depth -= 1;
                current.push(c);
            }
            _ => current.push(c),
        }
    }
    alternatives.push(current);

    alternatives
        .into_iter()
        .flat_map(|alt| expand_braces(&format!("{prefix}{alt}{suffix}")))
        .take(MAX_BRACE_ALTERNATIVES)
        .collect()
}

/// Iterative matcher with single-star backtracking. `steps` is shared by all
/// alternatives of one pattern.
fn match_chars(pat: &[char], name: &[char], steps: &Cell<usize>) -> bool {
    let (mut p, mut n) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while n < name.len() {
        steps.set(steps.get() + 1);
        if steps.get() > MAX_MATCH_STEPS {
            return false;
        }
        if p < pat.len() {
            match pat[p] {
                '*' => {
                    star = Some((p, n));
                    p += 1;
                    continue;
                }
                '?' => {
                    p += 1;
                    n += 1;
                    continue;
                }
                '[' => {
                    if let Some((matched, next)) = match_class(pat, p, name[n]) {
                        if matched {
                            p = next;
                            n += 1;
                            continue;
                        }
                    } else if name[n] == '[' {
                        p += 1;
                        n += 1;
                        continue;
                    }
                }
                c if c == name[n] => {
                    p += 1;
                    n += 1;
                    continue;
                }
                _ => {}
            }
        }
        match star {
            Some((sp, sn)) => {
                p = sp + 1;
                n = sn + 1;
                star = Some((sp, sn + 1));
            }
            None => return false,
        }
    }
    pat[p..].iter().all(|&c| c == '*')
}

/// Evaluates the character class starting at `pat[start] == '['`.
/// Returns `None` when the class is unterminated.
fn match_class(pat: &[char], start: usize, c: char) -> Option<(bool, usize)> {
    let mut i = start + 1;
    let negated = matches!(pat.get(i), Some('!') | Some('^'));
    if negated {
        i += 1;
    }
    let mut matched = false;
    let mut first = true;
    while i < pat.len() {
        if pat[i] == ']' && !first {
            return Some((matched != negated, i + 1));
        }
        first = false;
        if i + 2 < pat.len() && pat[i + 1] == '-' && pat[i + 2] != ']' {
            if pat[i] <= c && c <= pat[i + 2] {
                matched = true;
            }
            i += 3;
        } else {
            if pat[i] == c {
                matched = true;
            }
            i += 1;
        }
    }
    None
}
