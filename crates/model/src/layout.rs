//! Per-timestep token layout.
//!
//! Every step of the flattened sequence is the same block of tokens: content
//! segments first (language, state, patch latents, observation summary, then
//! the hand-camera pair when enabled), followed by one query segment per active
//! prediction head. The composer, the attention mask and the decoder all read
//! offsets from here.

use crate::heads::Routing;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SegmentKind {
    Language,
    State,
    Patch,
    Obs,
    HandPatch,
    HandObs,
    ActionQuery,
    ObsQuery,
    ObsHandQuery,
}

impl SegmentKind {
    pub fn is_query(&self) -> bool {
        matches!(
            self,
            SegmentKind::ActionQuery | SegmentKind::ObsQuery | SegmentKind::ObsHandQuery
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            SegmentKind::Language => "language",
            SegmentKind::State => "state",
            SegmentKind::Patch => "patch",
            SegmentKind::Obs => "obs",
            SegmentKind::HandPatch => "hand_patch",
            SegmentKind::HandObs => "hand_obs",
            SegmentKind::ActionQuery => "action_query",
            SegmentKind::ObsQuery => "obs_query",
            SegmentKind::ObsHandQuery => "obs_hand_query",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub kind: SegmentKind,
    pub len: usize,
    pub start: usize,
}

impl Segment {
    pub fn end(&self) -> usize {
        self.start + self.len
    }
}

/// Inputs to [`TokenLayout::compute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutSpec {
    pub routing: Routing,
    pub n_patch_latents: usize,
    pub chunk_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenLayout {
    segments: Vec<Segment>,
    content_tokens: usize,
    total_per_step: usize,
}

impl TokenLayout {
    pub fn compute(spec: &LayoutSpec) -> Self {
        let n = spec.n_patch_latents;
        let heads = spec.routing.heads;

        let mut plan = vec![
            (SegmentKind::Language, 1),
            (SegmentKind::State, 1),
            (SegmentKind::Patch, n),
            (SegmentKind::Obs, 1),
        ];
        if spec.routing.use_hand_rgb {
            plan.push((SegmentKind::HandPatch, n));
            plan.push((SegmentKind::HandObs, 1));
        }
        if heads.predicts_actions() {
            plan.push((SegmentKind::ActionQuery, spec.chunk_size));
        }
        if heads.predicts_obs() {
            plan.push((SegmentKind::ObsQuery, n + 1));
        }
        if heads.predicts_obs_hand() {
            plan.push((SegmentKind::ObsHandQuery, n + 1));
        }

        let mut segments = Vec::with_capacity(plan.len());
        let mut cursor = 0;
        let mut content_tokens = 0;
        for (kind, len) in plan {
            segments.push(Segment {
                kind,
                len,
                start: cursor,
            });
            cursor += len;
            if !kind.is_query() {
                content_tokens = cursor;
            }
        }

        Self {
            segments,
            content_tokens,
            total_per_step: cursor,
        }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Width of the content block, which is also the width each step's
    /// validity flag is broadcast to.
    pub fn content_tokens(&self) -> usize {
        self.content_tokens
    }

    pub fn total_per_step(&self) -> usize {
        self.total_per_step
    }

    pub fn query_tokens(&self) -> usize {
        self.total_per_step - self.content_tokens
    }

    pub fn segment(&self, kind: SegmentKind) -> Option<&Segment> {
        self.segments.iter().find(|segment| segment.kind == kind)
    }

    pub fn start(&self, kind: SegmentKind) -> Option<usize> {
        self.segment(kind).map(|segment| segment.start)
    }

    pub fn content_segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter().filter(|segment| !segment.kind.is_query())
    }

    pub fn query_segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter().filter(|segment| segment.kind.is_query())
    }

    /// Length of the flattened sequence for `time` steps.
    pub fn flattened_len(&self, time: usize) -> usize {
        time * self.total_per_step
    }

    /// Short human-readable form, e.g. `language:1 state:1 patch:9 ...`.
    pub fn describe(&self) -> String {
        self.segments
            .iter()
            .map(|segment| format!("{}:{}@{}", segment.kind.name(), segment.len, segment.start))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
