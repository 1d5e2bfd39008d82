use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Only this many leading tokens of a document feed the model; market
/// titles are short and the tail of long combo docs adds little.
const MAX_DOC_TOKENS: usize = 64;

/// Multinomial Naive Bayes over unigram + adjacent-bigram features,
/// persisted as a versioned JSON artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorModel {
    pub model_version: String,
    #[serde(default)]
    pub created_at: Option<String>,
    pub anchor_types: Vec<String>,
    pub vocab: Vec<String>,
    pub alpha: f64,
    pub log_prior: Vec<f64>,
    pub log_prob: Vec<Vec<f64>>,
    #[serde(skip)]
    vocab_index: HashMap<String, usize>,
}

impl AnchorModel {
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let mut model: AnchorModel =
            serde_json::from_slice(data).context("anchor model parse failed")?;
        model.validate()?;
        model.build_index();
        Ok(model)
    }

    fn validate(&self) -> Result<()> {
        let classes = self.anchor_types.len();
        if classes == 0 {
            bail!("anchor model has no classes");
        }
        if self.log_prior.len() != classes || self.log_prob.len() != classes {
            bail!(
                "anchor model dimension mismatch: {} classes, {} priors, {} likelihood rows",
                classes,
                self.log_prior.len(),
                self.log_prob.len()
            );
        }
        for row in &self.log_prob {
            if row.len() != self.vocab.len() {
                bail!(
                    "anchor model vocab mismatch: {} terms, row of {}",
                    self.vocab.len(),
                    row.len()
                );
            }
        }
        Ok(())
    }

    fn build_index(&mut self) {
        self.vocab_index = self
            .vocab
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i))
            .collect();
    }

    /// Argmax class over log prior + summed log likelihood of in-vocab
    /// tokens; confidence is the softmax weight of the winning logit.
    pub fn predict(&self, text: &str) -> Option<(String, f64)> {
        if self.anchor_types.is_empty() {
            return None;
        }
        let mut logits = self.log_prior.clone();
        for token in tokenize(text) {
            if let Some(&term) = self.vocab_index.get(&token) {
                for (class, logit) in logits.iter_mut().enumerate() {
                    *logit += self.log_prob[class][term];
                }
            }
        }
        let (best, best_logit) = logits
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))?;
        // Softmax with max subtraction for stability.
        let denom: f64 = logits.iter().map(|l| (l - best_logit).exp()).sum();
        Some((self.anchor_types[best].clone(), 1.0 / denom))
    }
}

/// Unigrams plus adjacent-token bigrams over a bounded prefix of an
/// already-normalized document.
pub fn tokenize(text: &str) -> Vec<String> {
    let unigrams: Vec<&str> = text.split_whitespace().take(MAX_DOC_TOKENS).collect();
    let mut tokens: Vec<String> = unigrams.iter().map(|t| t.to_string()).collect();
    for pair in unigrams.windows(2) {
        tokens.push(format!("{}_{}", pair[0], pair[1]));
    }
    tokens
}

// ── Offline training ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TrainingDoc {
    pub provider: String,
    pub market_id: String,
    /// Normalized document text (see `profiler::normalize_text`).
    pub text: String,
    pub anchor_type: String,
}

#[derive(Debug, Clone)]
pub struct TrainParams {
    pub min_df: usize,
    pub max_vocab: usize,
    pub alpha: f64,
    pub model_version: String,
}

impl Default for TrainParams {
    fn default() -> Self {
        TrainParams {
            min_df: 3,
            max_vocab: 3500,
            alpha: 1.0,
            model_version: "anchor-nb-1".into(),
        }
    }
}

#[derive(Debug)]
pub struct TrainReport {
    pub model: AnchorModel,
    pub train_count: usize,
    pub test_count: usize,
    pub test_accuracy: Option<f64>,
}

/// Deterministic train/test bucket for a market key: FNV-1a of
/// `provider:market_id` mod 10. Buckets 0–7 train, 8–9 test.
pub fn split_bucket(provider: &str, market_id: &str) -> u64 {
    fnv1a_64(&format!("{provider}:{market_id}")) % 10
}

fn fnv1a_64(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in s.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Train a model from labelled documents. Deterministic: the split, the
/// vocabulary ordering, and the class ordering all derive from the input
/// alone.
pub fn train(docs: &[TrainingDoc], params: &TrainParams) -> Result<TrainReport> {
    let (train_docs, test_docs): (Vec<_>, Vec<_>) = docs
        .iter()
        .partition(|d| split_bucket(&d.provider, &d.market_id) < 8);
    if train_docs.is_empty() {
        bail!("no training documents after split");
    }

    let mut classes: Vec<String> = train_docs
        .iter()
        .map(|d| d.anchor_type.clone())
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    classes.sort();

    // Document frequency over the training split.
    let mut df: HashMap<String, usize> = HashMap::new();
    for doc in &train_docs {
        let unique: HashSet<String> = tokenize(&doc.text).into_iter().collect();
        for token in unique {
            *df.entry(token).or_default() += 1;
        }
    }
    let mut ranked: Vec<(String, usize)> = df
        .into_iter()
        .filter(|(_, count)| *count >= params.min_df)
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.truncate(params.max_vocab);
    let vocab: Vec<String> = ranked.into_iter().map(|(t, _)| t).collect();
    let vocab_index: HashMap<&str, usize> = vocab
        .iter()
        .enumerate()
        .map(|(i, t)| (t.as_str(), i))
        .collect();

    let class_index: HashMap<&str, usize> = classes
        .iter()
        .enumerate()
        .map(|(i, c)| (c.as_str(), i))
        .collect();
    let mut class_docs = vec![0usize; classes.len()];
    let mut term_counts = vec![vec![0usize; vocab.len()]; classes.len()];
    for doc in &train_docs {
        let class = class_index[doc.anchor_type.as_str()];
        class_docs[class] += 1;
        for token in tokenize(&doc.text) {
            if let Some(&term) = vocab_index.get(token.as_str()) {
                term_counts[class][term] += 1;
            }
        }
    }

    let total_docs = train_docs.len() as f64;
    let log_prior: Vec<f64> = class_docs
        .iter()
        .map(|&n| (n as f64 / total_docs).ln())
        .collect();
    let vocab_size = vocab.len() as f64;
    let log_prob: Vec<Vec<f64>> = term_counts
        .iter()
        .map(|counts| {
            let class_total: usize = counts.iter().sum();
            let denom = class_total as f64 + params.alpha * vocab_size;
            counts
                .iter()
                .map(|&c| ((c as f64 + params.alpha) / denom).ln())
                .collect()
        })
        .collect();

    let mut model = AnchorModel {
        model_version: params.model_version.clone(),
        created_at: Some(chrono::Utc::now().to_rfc3339()),
        anchor_types: classes,
        vocab,
        alpha: params.alpha,
        log_prior,
        log_prob,
        vocab_index: HashMap::new(),
    };
    model.build_index();

    let test_accuracy = if test_docs.is_empty() {
        None
    } else {
        let correct = test_docs
            .iter()
            .filter(|d| {
                model
                    .predict(&d.text)
                    .map(|(c, _)| c == d.anchor_type)
                    .unwrap_or(false)
            })
            .count();
        Some(correct as f64 / test_docs.len() as f64)
    };

    Ok(TrainReport {
        train_count: train_docs.len(),
        test_count: test_docs.len(),
        test_accuracy,
        model,
    })
}

// ── Hot reload ─────────────────────────────────────────────────────────────────

/// Shared handle to the active model. Readers snapshot an Arc; the reloader
/// swaps it in place after a successful parse, so a broken artifact on disk
/// never evicts a working model.
#[derive(Clone)]
pub struct ModelHandle {
    path: PathBuf,
    slot: Arc<RwLock<Option<Arc<AnchorModel>>>>,
}

impl ModelHandle {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ModelHandle {
            path: path.into(),
            slot: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn current(&self) -> Option<Arc<AnchorModel>> {
        self.slot.read().await.clone()
    }

    /// Attempt to (re)load the artifact. Returns Ok(true) when a new model
    /// version was swapped in. A missing file is not an error; a corrupt
    /// file is, and leaves the previous model in place.
    pub async fn reload(&self) -> Result<bool> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no anchor model at {}", self.path.display());
                return Ok(false);
            }
            Err(e) => return Err(e).context("anchor model read failed"),
        };
        let model = AnchorModel::from_json(&data)?;
        let mut slot = self.slot.write().await;
        let changed = slot
            .as_ref()
            .map(|prev| prev.model_version != model.model_version)
            .unwrap_or(true);
        if changed {
            info!(
                "anchor model {} loaded ({} classes, {} terms)",
                model.model_version,
                model.anchor_types.len(),
                model.vocab.len()
            );
        }
        *slot = Some(Arc::new(model));
        Ok(changed)
    }
}

/// Background task that re-reads the artifact at a bounded interval.
pub fn spawn_reloader(handle: ModelHandle, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            if let Err(e) = handle.reload().await {
                warn!("anchor model reload failed, keeping previous: {:#}", e);
            }
        }
    })
}

#[cfg(test)]
pub mod tests_support {
    use super::*;

    /// A vocabulary-free model whose prior pins the given class at 0.9
    /// confidence, for cascade tests.
    pub fn constant_model(class: &str) -> AnchorModel {
        let mut model = AnchorModel {
            model_version: "test-fixed".into(),
            created_at: None,
            anchor_types: vec![class.to_string(), "other_unknown".into()],
            vocab: vec![],
            alpha: 1.0,
            log_prior: vec![0.9f64.ln(), 0.1f64.ln()],
            log_prob: vec![vec![], vec![]],
            vocab_index: HashMap::new(),
        };
        model.build_index();
        model
    }
}
