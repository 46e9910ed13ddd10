//! Modality embeddings supplied by the upstream feature extractors.

use std::collections::BTreeMap;

use candle_core::Tensor;

use crate::{config::ModelConfig, layout::SegmentKind};

/// Content modalities, declared in canonical stacking order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Modality {
    Language,
    State,
    Patch,
    Obs,
    HandPatch,
    HandObs,
}

impl Modality {
    pub const ALL: [Modality; 6] = [
        Modality::Language,
        Modality::State,
        Modality::Patch,
        Modality::Obs,
        Modality::HandPatch,
        Modality::HandObs,
    ];

    pub fn name(&self) -> &'static str {
        self.segment().name()
    }

    pub fn segment(&self) -> SegmentKind {
        match self {
            Modality::Language => SegmentKind::Language,
            Modality::State => SegmentKind::State,
            Modality::Patch => SegmentKind::Patch,
            Modality::Obs => SegmentKind::Obs,
            Modality::HandPatch => SegmentKind::HandPatch,
            Modality::HandObs => SegmentKind::HandObs,
        }
    }

    pub fn for_segment(kind: SegmentKind) -> Option<Self> {
        Self::ALL.into_iter().find(|modality| modality.segment() == kind)
    }

    /// Tokens this modality contributes to each step.
    pub fn token_count(&self, config: &ModelConfig) -> usize {
        match self {
            Modality::Patch | Modality::HandPatch => config.n_patch_latents,
            _ => 1,
        }
    }

    pub fn is_hand(&self) -> bool {
        matches!(self, Modality::HandPatch | Modality::HandObs)
    }
}

/// Modality → `(batch, time, count, hidden)` embedding.
///
/// Iteration follows canonical order regardless of insertion order.
#[derive(Debug, Clone, Default)]
pub struct ModalityEmbeddings {
    entries: BTreeMap<Modality, Tensor>,
}

impl ModalityEmbeddings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, modality: Modality, embedding: Tensor) -> Option<Tensor> {
        self.entries.insert(modality, embedding)
    }

    pub fn with(mut self, modality: Modality, embedding: Tensor) -> Self {
        self.insert(modality, embedding);
        self
    }

    pub fn get(&self, modality: Modality) -> Option<&Tensor> {
        self.entries.get(&modality)
    }

    pub fn contains(&self, modality: Modality) -> bool {
        self.entries.contains_key(&modality)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Modality, &Tensor)> {
        self.entries.iter().map(|(modality, tensor)| (*modality, tensor))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
