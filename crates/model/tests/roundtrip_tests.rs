//! Compose, pass through an identity backbone, and read spans back at the
//! layout offsets.

mod common;

use anyhow::Result;
use candle_core::Tensor;
use candle_nn::VarMap;
use common::{all_valid, distinct_values, fill_var, small_config, tag, tagged_embeddings, var_builder};
use model::{
    query_spans, Backbone, HeadSet, IdentityBackbone, Modality, ModelConfig, PredictionDecoder, Routing,
    SegmentKind, SequenceComposer,
};

const ACTION_TAG: f32 = 50.0;
const OBS_TAG: f32 = 100.0;
const OBS_HAND_TAG: f32 = 200.0;

fn config() -> ModelConfig {
    ModelConfig {
        fwd_pred_hand: true,
        ..small_config()
    }
}

fn tagged_composer(varmap: &VarMap, config: &ModelConfig) -> Result<SequenceComposer> {
    let heads = config.head_set()?;
    let composer = SequenceComposer::new(var_builder(varmap), config, &heads)?;
    fill_var(varmap, "embed_timestep.weight", 0.0)?;
    fill_var(varmap, "action_queries.weight", ACTION_TAG)?;
    fill_var(varmap, "obs_queries.weight", OBS_TAG)?;
    fill_var(varmap, "obs_hand_queries.weight", OBS_HAND_TAG)?;
    Ok(composer)
}

fn identity_pass(stack_flat: &Tensor, mask: &Tensor, dims: &[usize]) -> Result<Tensor> {
    let out = IdentityBackbone.forward(stack_flat, mask)?;
    Ok(out.reshape(dims)?)
}

#[test]
fn every_segment_reads_back_its_own_tag() -> Result<()> {
    let config = config();
    let varmap = VarMap::new();
    let composer = tagged_composer(&varmap, &config)?;
    let routing = config.default_routing()?;

    let composed = composer.compose(&tagged_embeddings(&config, 2)?, &all_valid(2, 3)?, &routing)?;
    let hidden = identity_pass(
        &composed.flattened()?,
        &composed.attention_mask,
        composed.stack.dims(),
    )?;

    for segment in composed.layout.content_segments() {
        let modality = Modality::for_segment(segment.kind).expect("content segment");
        let span = hidden.narrow(2, segment.start, segment.len)?;
        assert_eq!(distinct_values(&span)?, vec![tag(modality)], "{:?}", segment.kind);
    }

    let spans = query_spans(&hidden, &composed.layout)?;
    let kinds: Vec<_> = spans.iter().map(|(segment, _)| segment.kind).collect();
    assert_eq!(
        kinds,
        vec![
            SegmentKind::ActionQuery,
            SegmentKind::ObsQuery,
            SegmentKind::ObsHandQuery
        ]
    );
    for (segment, span) in spans {
        let expected = match segment.kind {
            SegmentKind::ActionQuery => ACTION_TAG,
            SegmentKind::ObsQuery => OBS_TAG,
            _ => OBS_HAND_TAG,
        };
        assert_eq!(span.dims()[2], segment.len);
        assert_eq!(distinct_values(&span)?, vec![expected], "{:?}", segment.kind);
    }
    Ok(())
}

#[test]
fn narrower_routing_moves_no_surviving_span() -> Result<()> {
    let config = config();
    let varmap = VarMap::new();
    let composer = tagged_composer(&varmap, &config)?;
    let full = config.default_routing()?;
    let without_obs = Routing::new(HeadSet::from_flags(true, false, false)?, false);

    let embeddings = tagged_embeddings(&config, 1)?;
    let wide = composer.compose(&embeddings, &all_valid(1, 3)?, &full)?;
    let narrow = composer.compose(&embeddings, &all_valid(1, 3)?, &without_obs)?;

    assert_eq!(
        wide.layout.total_per_step() - narrow.layout.total_per_step(),
        2 * (config.n_patch_latents + 1)
    );
    assert_eq!(
        wide.layout.start(SegmentKind::ActionQuery),
        narrow.layout.start(SegmentKind::ActionQuery)
    );
    let spans = query_spans(&narrow.stack, &narrow.layout)?;
    assert_eq!(spans.len(), 1);
    assert_eq!(distinct_values(&spans[0].1)?, vec![ACTION_TAG]);
    Ok(())
}

#[test]
fn decoder_outputs_follow_identity_spans() -> Result<()> {
    let config = config();
    let varmap = VarMap::new();
    let composer = tagged_composer(&varmap, &config)?;
    let heads = config.head_set()?;
    let decoder = PredictionDecoder::new(var_builder(&varmap).pp("heads"), &config, &heads)?;

    let composed = composer.compose(
        &tagged_embeddings(&config, 2)?,
        &all_valid(2, 3)?,
        &config.default_routing()?,
    )?;
    let hidden = identity_pass(
        &composed.flattened()?,
        &composed.attention_mask,
        composed.stack.dims(),
    )?;
    let predictions = decoder.decode(&hidden, &composed.layout)?;

    assert_eq!(predictions.arm.as_ref().map(|t| t.dims().to_vec()), Some(vec![2, 3, 2, 6]));
    assert_eq!(predictions.gripper.as_ref().map(|t| t.dims().to_vec()), Some(vec![2, 3, 2, 1]));
    assert_eq!(predictions.obs.as_ref().map(|t| t.dims().to_vec()), Some(vec![2, 3, 2, 48]));
    assert_eq!(predictions.obs_hand.as_ref().map(|t| t.dims().to_vec()), Some(vec![2, 3, 2, 48]));
    assert_eq!(predictions.quantiles.dims(), &[2, 5]);

    // Every action-query token carries the same tag, so every chunk offset
    // at every step decodes to the same action.
    let arm = predictions.arm.expect("action head");
    let (b, t, c, d) = arm.dims4()?;
    let rows = arm.reshape((b * t * c, d))?.to_vec2::<f32>()?;
    for row in &rows[1..] {
        for (a, b) in row.iter().zip(&rows[0]) {
            assert!((a - b).abs() < 1e-5, "{a} vs {b}");
        }
    }
    Ok(())
}
