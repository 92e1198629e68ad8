// ============================================================
// Layer 6 — Metrics and Evaluation
// ============================================================
// Two jobs:
//
//   1. Score predicted label sequences against gold ones
//        - token accuracy, always
//        - entity-span precision / recall / F1 for BIO and
//          BMES schemes (exact span + type match)
//      The headline score is F1 for segmented schemes and
//      accuracy otherwise.
//
//   2. Record one row per epoch in metrics.csv:
//
//        epoch,train_loss,dev_score,test_score,refined_ratio
//        1,5123.441000,0.712300,0.698800,0.214000
//        2,2210.070000,0.801100,0.787400,0.176000
//
//      refined_ratio is the share of training tokens whose
//      final label came from the refinement stage.
//
// Reference: Tjong Kim Sang & De Meulder (2003) CoNLL-2003
//            Rust Book §12 (I/O and File Handling)

use anyhow::{Context, Result};
use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::PathBuf,
};
use serde::{Deserialize, Serialize};

use crate::data::alphabet::TagScheme;

// ─── Spans ────────────────────────────────────────────────────────────────────
/// An entity span over token indices, inclusive on both ends
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Span {
    pub start: usize,
    pub end:   usize,
    pub kind:  String,
}

/// "B-PER" → ("B", "PER"); "O" → ("O", "")
fn split_label(label: &str) -> (String, &str) {
    match label.split_once('-') {
        Some((prefix, kind)) => (prefix.to_uppercase(), kind),
        None                 => (label.to_uppercase(), ""),
    }
}

/// Entity spans encoded by a label sequence.
/// A span left open by a malformed sequence is closed where the
/// next span starts, or at an O.
pub fn extract_spans(labels: &[&str], scheme: TagScheme) -> Vec<Span> {
    let mut spans = Vec::new();
    let mut open: Option<(usize, String)> = None;

    let close = |open: &mut Option<(usize, String)>, spans: &mut Vec<Span>, end: usize| {
        if let Some((start, kind)) = open.take() {
            spans.push(Span { start, end, kind });
        }
    };

    for (i, label) in labels.iter().enumerate() {
        let (prefix, kind) = split_label(label);
        let continues = matches!(&open, Some((_, k)) if k == kind);

        match (scheme, prefix.as_str()) {
            (TagScheme::NoSeg, _) => {}
            (_, "B") => {
                close(&mut open, &mut spans, i.saturating_sub(1));
                open = Some((i, kind.to_string()));
            }
            (TagScheme::Bio, "I") | (TagScheme::Bmes, "I" | "M") => {
                if !continues {
                    close(&mut open, &mut spans, i.saturating_sub(1));
                    open = Some((i, kind.to_string()));
                }
            }
            (TagScheme::Bmes, "E") => {
                if !continues {
                    close(&mut open, &mut spans, i.saturating_sub(1));
                    open = Some((i, kind.to_string()));
                }
                close(&mut open, &mut spans, i);
            }
            (TagScheme::Bmes, "S") => {
                close(&mut open, &mut spans, i.saturating_sub(1));
                spans.push(Span { start: i, end: i, kind: kind.to_string() });
            }
            _ => close(&mut open, &mut spans, i.saturating_sub(1)),
        }
    }
    close(&mut open, &mut spans, labels.len().saturating_sub(1));
    spans
}

// ─── Evaluation ───────────────────────────────────────────────────────────────
/// Running counts over a whole corpus
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    pub tokens:     usize,
    pub correct:    usize,
    pub gold_spans: usize,
    pub pred_spans: usize,
    pub matched:    usize,
}

impl Evaluation {
    /// Add one sentence. `gold` and `pred` must be the same length.
    pub fn add_sentence(&mut self, gold: &[&str], pred: &[&str], scheme: TagScheme) {
        self.tokens  += gold.len();
        self.correct += gold.iter().zip(pred).filter(|(g, p)| g == p).count();

        if scheme.is_segmented() {
            let gold_spans = extract_spans(gold, scheme);
            let pred_spans = extract_spans(pred, scheme);
            self.gold_spans += gold_spans.len();
            self.pred_spans += pred_spans.len();
            self.matched    += pred_spans.iter().filter(|s| gold_spans.contains(s)).count();
        }
    }

    pub fn accuracy(&self) -> f64 {
        if self.tokens == 0 { 0.0 } else { self.correct as f64 / self.tokens as f64 }
    }

    pub fn precision(&self) -> f64 {
        if self.pred_spans == 0 { 0.0 } else { self.matched as f64 / self.pred_spans as f64 }
    }

    pub fn recall(&self) -> f64 {
        if self.gold_spans == 0 { 0.0 } else { self.matched as f64 / self.gold_spans as f64 }
    }

    pub fn f1(&self) -> f64 {
        let (p, r) = (self.precision(), self.recall());
        if p + r == 0.0 { 0.0 } else { 2.0 * p * r / (p + r) }
    }

    /// F1 for segmented schemes, accuracy otherwise
    pub fn score(&self, scheme: TagScheme) -> f64 {
        if scheme.is_segmented() { self.f1() } else { self.accuracy() }
    }
}

// ─── Epoch Metrics ────────────────────────────────────────────────────────────
/// One row of metrics data for a single training epoch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// The epoch number (starts at 1)
    pub epoch: usize,

    /// Summed loss over every training batch of the epoch
    pub train_loss: f64,

    /// Dev score (F1 or accuracy); NaN without a dev split
    pub dev_score: f64,

    /// Test score (F1 or accuracy); NaN without a test split
    pub test_score: f64,

    /// Share of training tokens that took the refined label
    pub refined_ratio: f64,
}

impl EpochMetrics {
    pub fn new(
        epoch:         usize,
        train_loss:    f64,
        dev_score:     f64,
        test_score:    f64,
        refined_ratio: f64,
    ) -> Self {
        Self { epoch, train_loss, dev_score, test_score, refined_ratio }
    }

    /// True if the dev score beats the best seen so far
    pub fn is_improvement(&self, best_dev_score: f64) -> bool {
        self.dev_score > best_dev_score
    }
}

/// Logs epoch metrics to a CSV file for later analysis.
pub struct MetricsLogger {
    csv_path: PathBuf,
}

impl MetricsLogger {
    /// Writes the CSV header if the file doesn't exist yet
    pub fn new(dir: impl Into<String>) -> Result<Self> {
        let dir = PathBuf::from(dir.into());
        fs::create_dir_all(&dir)
            .with_context(|| format!("Cannot create metrics directory '{}'", dir.display()))?;

        let csv_path = dir.join("metrics.csv");
        if !csv_path.exists() {
            let mut f = fs::File::create(&csv_path)?;
            writeln!(f, "epoch,train_loss,dev_score,test_score,refined_ratio")?;
            tracing::debug!("Created metrics CSV: '{}'", csv_path.display());
        }

        Ok(Self { csv_path })
    }

    /// Append one epoch's metrics as a new row
    pub fn log(&self, m: &EpochMetrics) -> Result<()> {
        let mut f = OpenOptions::new()
            .append(true)
            .open(&self.csv_path)
            .with_context(|| format!("Cannot open '{}'", self.csv_path.display()))?;

        writeln!(
            f,
            "{},{:.6},{:.6},{:.6},{:.6}",
            m.epoch,
            m.train_loss,
            m.dev_score,
            m.test_score,
            m.refined_ratio,
        )?;

        tracing::debug!(
            "Logged epoch {} metrics: train_loss={:.4}, dev_score={:.4}",
            m.epoch,
            m.train_loss,
            m.dev_score,
        );
        Ok(())
    }

    pub fn csv_path(&self) -> &PathBuf {
        &self.csv_path
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    fn span(start: usize, end: usize, kind: &str) -> Span {
        Span { start, end, kind: kind.to_string() }
    }

    #[test]
    fn test_bio_spans() {
        let labels = ["B-ORG", "O", "B-PER", "I-PER", "I-LOC", "O"];
        assert_eq!(
            extract_spans(&labels, TagScheme::Bio),
            vec![span(0, 0, "ORG"), span(2, 3, "PER"), span(4, 4, "LOC")]
        );
    }

    #[test]
    fn test_bio_span_running_to_the_end() {
        let labels = ["O", "B-MISC", "I-MISC"];
        assert_eq!(extract_spans(&labels, TagScheme::Bio), vec![span(1, 2, "MISC")]);
    }

    #[test]
    fn test_bmes_spans() {
        let labels = ["S-LOC", "B-PER", "M-PER", "E-PER", "O", "B-ORG", "E-ORG"];
        assert_eq!(
            extract_spans(&labels, TagScheme::Bmes),
            vec![span(0, 0, "LOC"), span(1, 3, "PER"), span(5, 6, "ORG")]
        );
    }

    #[test]
    fn test_noseg_has_no_spans() {
        assert!(extract_spans(&["NN", "VB"], TagScheme::NoSeg).is_empty());
    }

    #[test]
    fn test_evaluation_scores() {
        let mut eval = Evaluation::default();
        eval.add_sentence(
            &["B-PER", "I-PER", "O", "B-LOC"],
            &["B-PER", "I-PER", "O", "B-ORG"],
            TagScheme::Bio,
        );
        assert_eq!(eval.accuracy(), 0.75);
        assert_eq!(eval.precision(), 0.5);
        assert_eq!(eval.recall(), 0.5);
        assert!((eval.score(TagScheme::Bio) - 0.5).abs() < 1e-12);
        assert_eq!(eval.score(TagScheme::NoSeg), 0.75);
    }

    #[test]
    fn test_empty_evaluation_is_zero() {
        let eval = Evaluation::default();
        assert_eq!(eval.f1(), 0.0);
        assert_eq!(eval.accuracy(), 0.0);
    }

    #[test]
    fn test_is_improvement() {
        let m = EpochMetrics::new(2, 100.0, 0.8, 0.7, 0.1);
        assert!(m.is_improvement(0.75));
        assert!(!m.is_improvement(0.8));
    }

    #[test]
    fn test_logger_appends_rows() {
        let dir    = tempfile::tempdir().unwrap();
        let logger = MetricsLogger::new(dir.path().to_string_lossy()).unwrap();
        logger.log(&EpochMetrics::new(1, 10.0, 0.5, 0.4, 0.2)).unwrap();
        logger.log(&EpochMetrics::new(2, 8.0, 0.6, 0.5, 0.1)).unwrap();

        let text = fs::read_to_string(logger.csv_path()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "epoch,train_loss,dev_score,test_score,refined_ratio");
        assert!(lines[2].starts_with("2,8.000000,0.600000"));
    }
}
