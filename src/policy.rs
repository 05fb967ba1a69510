use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::audit::{AuditEmitter, AuditEvent};

/* ============================= ERRORS ============================= */

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("failed to read policy source {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse policy document: {0}")]
    Parse(String),

    #[error("required policy '{name}' missing at {path}")]
    MissingRequired { name: String, path: String },

    #[error("policy '{0}' has no default clause")]
    MissingDefault(String),

    #[error("policy evaluation matched no rule and has no default")]
    NoResult,

    #[error("unknown policy '{0}'")]
    Unknown(String),
}

/* ============================= KINDS ============================= */

/// The four named policies the classifiers consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyKind {
    Severity,
    Environment,
    Priority,
    CustomLabels,
}

impl PolicyKind {
    pub const ALL: [PolicyKind; 4] = [
        PolicyKind::Severity,
        PolicyKind::Environment,
        PolicyKind::Priority,
        PolicyKind::CustomLabels,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PolicyKind::Severity => "severity",
            PolicyKind::Environment => "environment",
            PolicyKind::Priority => "priority",
            PolicyKind::CustomLabels => "custom-labels",
        }
    }

    /// Well-known source file under the policy directory.
    pub fn file_name(&self) -> &'static str {
        match self {
            PolicyKind::Severity => "severity.rego",
            PolicyKind::Environment => "environment.rego",
            PolicyKind::Priority => "priority.rego",
            PolicyKind::CustomLabels => "labels.rego",
        }
    }

    /// Required policies have no sensible built-in fallback; a missing source
    /// file or missing default clause is a fatal boot misconfiguration.
    pub fn is_required(&self) -> bool {
        matches!(self, PolicyKind::Severity | PolicyKind::Priority)
    }

    /// Fallback yielded by the sentinel evaluator for optional policies.
    fn sentinel_value(&self) -> Value {
        match self {
            PolicyKind::Environment => Value::String("unknown".to_string()),
            PolicyKind::CustomLabels => Value::Object(serde_json::Map::new()),
            // Required kinds never get a sentinel.
            PolicyKind::Severity => Value::String("warning".to_string()),
            PolicyKind::Priority => Value::String("P2".to_string()),
        }
    }
}

/* ============================= ENGINE SEAM ============================= */

/// Outcome of a single policy evaluation. `matched` distinguishes a rule hit
/// from the policy's default clause, which classifiers report as a different
/// determination source.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyVerdict {
    pub value: Value,
    pub matched: bool,
}

/// Compiles policy source bytes into evaluators. The policy runtime is
/// pluggable behind this seam; the store only sees sources and hashes.
pub trait PolicyEngine: Send + Sync {
    fn compile(&self, source: &str) -> Result<Box<dyn CompiledPolicy>, PolicyError>;
}

/// A compiled policy. Evaluation is deterministic for a fixed source.
pub trait CompiledPolicy: Send + Sync + std::fmt::Debug {
    fn evaluate(&self, input: &Value) -> Result<PolicyVerdict, PolicyError>;
    fn has_default(&self) -> bool;
}

/* ============================= RULE ENGINE ============================= */

/// Built-in declarative evaluator: an ordered list of `when`/`emit` rules over
/// dot-paths into the input document, plus an optional `default`.
///
/// ```yaml
/// rules:
///   - when: { signal.severity: [critical, fatal, P1] }
///     emit: critical
/// default: warning
/// ```
pub struct RuleEngine;

#[derive(Debug, Deserialize)]
struct RuleDoc {
    #[serde(default)]
    rules: Vec<RuleSpec>,
    #[serde(default)]
    default: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RuleSpec {
    when: BTreeMap<String, Value>,
    emit: Value,
}

#[derive(Debug)]
struct RuleSet {
    rules: Vec<RuleSpec>,
    default: Option<Value>,
}

impl PolicyEngine for RuleEngine {
    fn compile(&self, source: &str) -> Result<Box<dyn CompiledPolicy>, PolicyError> {
        let doc: RuleDoc =
            serde_yaml::from_str(source).map_err(|e| PolicyError::Parse(e.to_string()))?;
        Ok(Box::new(RuleSet {
            rules: doc.rules,
            default: doc.default,
        }))
    }
}

impl CompiledPolicy for RuleSet {
    fn evaluate(&self, input: &Value) -> Result<PolicyVerdict, PolicyError> {
        for rule in &self.rules {
            if rule_matches(input, &rule.when) {
                return Ok(PolicyVerdict {
                    value: rule.emit.clone(),
                    matched: true,
                });
            }
        }
        match &self.default {
            Some(value) => Ok(PolicyVerdict {
                value: value.clone(),
                matched: false,
            }),
            None => Err(PolicyError::NoResult),
        }
    }

    fn has_default(&self) -> bool {
        self.default.is_some()
    }
}

fn rule_matches(input: &Value, when: &BTreeMap<String, Value>) -> bool {
    when.iter().all(|(path, expected)| {
        lookup_path(input, path).is_some_and(|actual| value_matches(expected, actual))
    })
}

fn lookup_path<'a>(input: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = input;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

fn value_matches(expected: &Value, actual: &Value) -> bool {
    match expected {
        Value::Array(options) => options.iter().any(|o| value_matches(o, actual)),
        Value::String(pattern) if pattern.contains('*') => {
            actual.as_str().is_some_and(|s| glob_match(pattern, s))
        }
        other => other == actual,
    }
}

/// Minimal glob over '*' wildcards: anchored prefix and suffix, ordered
/// middle segments.
pub fn glob_match(pattern: &str, value: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == value;
    }

    let segments: Vec<&str> = pattern.split('*').collect();
    let mut rest = value;

    if let Some(first) = segments.first()
        && !first.is_empty()
    {
        match rest.strip_prefix(first) {
            Some(r) => rest = r,
            None => return false,
        }
    }

    if let Some(last) = segments.last()
        && segments.len() > 1
        && !last.is_empty()
    {
        match rest.strip_suffix(last) {
            Some(r) => rest = r,
            None => return false,
        }
    }

    let middle = &segments[1..segments.len().saturating_sub(1)];
    for segment in middle {
        if segment.is_empty() {
            continue;
        }
        match rest.find(segment) {
            Some(idx) => rest = &rest[idx + segment.len()..],
            None => return false,
        }
    }

    true
}

/* ============================= SENTINEL ============================= */

/// "No-policy" evaluator installed when an optional policy source is absent.
/// Always yields the policy-defined fallback, never a rule match.
#[derive(Debug)]
struct SentinelPolicy {
    value: Value,
}

impl CompiledPolicy for SentinelPolicy {
    fn evaluate(&self, _input: &Value) -> Result<PolicyVerdict, PolicyError> {
        Ok(PolicyVerdict {
            value: self.value.clone(),
            matched: false,
        })
    }

    fn has_default(&self) -> bool {
        true
    }
}

/* ============================= HASHING ============================= */

/// Hex SHA-256 of the policy source bytes; recorded alongside every
/// classification decision for version traceability.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/* ============================= STORE ============================= */

#[derive(Debug)]
struct LoadedPolicy {
    hash: String,
    compiled: Box<dyn CompiledPolicy>,
}

type ReloadHandler = Box<dyn Fn(PolicyKind, &str) + Send + Sync>;

/// Holds the compiled evaluator per policy, keeps it in sync with the source
/// files, and exposes the content hash that produced each decision.
///
/// Evaluators are read-mostly: readers take the lock only long enough to
/// clone the `Arc`, and reloads swap the pointer atomically.
pub struct PolicyStore {
    engine: Box<dyn PolicyEngine>,
    dir: PathBuf,
    policies: HashMap<PolicyKind, RwLock<Arc<LoadedPolicy>>>,
    subscribers: Mutex<Vec<(PolicyKind, ReloadHandler)>>,
}

impl std::fmt::Debug for PolicyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyStore")
            .field("dir", &self.dir)
            .field("policies", &self.policies)
            .finish_non_exhaustive()
    }
}

impl PolicyStore {
    /// Load all four policies from `dir`.
    ///
    /// Missing or default-less required policies are fatal; optional policies
    /// fall back to sentinel evaluators.
    pub fn load(dir: &Path, engine: Box<dyn PolicyEngine>) -> Result<Self, PolicyError> {
        let mut policies = HashMap::new();

        for kind in PolicyKind::ALL {
            let path = dir.join(kind.file_name());
            let loaded = match std::fs::read_to_string(&path) {
                Ok(source) => {
                    let compiled = engine.compile(&source)?;
                    if kind.is_required() && !compiled.has_default() {
                        return Err(PolicyError::MissingDefault(kind.name().to_string()));
                    }
                    let hash = content_hash(source.as_bytes());
                    info!(policy = kind.name(), hash = %hash, "policy_loaded");
                    LoadedPolicy { hash, compiled }
                }
                Err(_) if kind.is_required() => {
                    return Err(PolicyError::MissingRequired {
                        name: kind.name().to_string(),
                        path: path.display().to_string(),
                    });
                }
                Err(_) => {
                    warn!(policy = kind.name(), "policy_missing_using_sentinel");
                    LoadedPolicy {
                        hash: content_hash(b""),
                        compiled: Box::new(SentinelPolicy {
                            value: kind.sentinel_value(),
                        }),
                    }
                }
            };
            policies.insert(kind, RwLock::new(Arc::new(loaded)));
        }

        Ok(Self {
            engine,
            dir: dir.to_path_buf(),
            policies,
            subscribers: Mutex::new(Vec::new()),
        })
    }

    fn current(&self, kind: PolicyKind) -> Result<Arc<LoadedPolicy>, PolicyError> {
        let lock = self
            .policies
            .get(&kind)
            .ok_or_else(|| PolicyError::Unknown(kind.name().to_string()))?;
        let guard = match lock.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(Arc::clone(&guard))
    }

    /// Evaluate the named policy. Deterministic for a fixed policy version;
    /// the returned hash identifies that version.
    pub fn evaluate(
        &self,
        kind: PolicyKind,
        input: &Value,
    ) -> Result<(PolicyVerdict, String), PolicyError> {
        let loaded = self.current(kind)?;
        let verdict = loaded.compiled.evaluate(input)?;
        Ok((verdict, loaded.hash.clone()))
    }

    pub fn policy_hash(&self, kind: PolicyKind) -> Result<String, PolicyError> {
        Ok(self.current(kind)?.hash.clone())
    }

    /// Register a handler invoked with the new hash after a successful swap.
    pub fn subscribe<F>(&self, kind: PolicyKind, handler: F)
    where
        F: Fn(PolicyKind, &str) + Send + Sync + 'static,
    {
        let mut subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subscribers.push((kind, Box::new(handler)));
    }

    /// Re-read one policy source; swap on content change.
    ///
    /// Returns the new hash when a swap happened. A compile failure keeps the
    /// previous evaluator and surfaces the error.
    pub fn try_reload(&self, kind: PolicyKind) -> Result<Option<String>, PolicyError> {
        let path = self.dir.join(kind.file_name());
        let source = match std::fs::read_to_string(&path) {
            Ok(source) => source,
            // A vanished source keeps the current evaluator.
            Err(_) => return Ok(None),
        };

        let hash = content_hash(source.as_bytes());
        if self.current(kind)?.hash == hash {
            return Ok(None);
        }

        let compiled = self.engine.compile(&source)?;
        if kind.is_required() && !compiled.has_default() {
            return Err(PolicyError::MissingDefault(kind.name().to_string()));
        }

        let lock = self
            .policies
            .get(&kind)
            .ok_or_else(|| PolicyError::Unknown(kind.name().to_string()))?;
        {
            let mut guard = match lock.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *guard = Arc::new(LoadedPolicy {
                hash: hash.clone(),
                compiled,
            });
        }

        info!(policy = kind.name(), hash = %hash, "policy_reloaded");

        let subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for (subscribed_kind, handler) in subscribers.iter() {
            if *subscribed_kind == kind {
                handler(kind, &hash);
            }
        }

        Ok(Some(hash))
    }

    /// Poll all policy sources every `interval` until shutdown. The poll
    /// period is the coalescing window: editor-style multi-write saves
    /// collapse into a single swap.
    pub fn spawn_reload_loop(
        self: Arc<Self>,
        interval: Duration,
        audit: Option<Arc<AuditEmitter>>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        info!("policy_reload_loop_stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        for kind in PolicyKind::ALL {
                            if let Err(e) = self.try_reload(kind) {
                                warn!(policy = kind.name(), error = %e, "policy_reload_failed");
                                if let Some(emitter) = &audit {
                                    emitter.append(AuditEvent::error_occurred(
                                        "policy-store",
                                        "policy-reload",
                                        &format!("{}: {e}", kind.name()),
                                    ));
                                }
                            }
                        }
                    }
                }
            }
        })
    }
}

/* ============================= TESTS ============================= */
