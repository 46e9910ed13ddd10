use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use model::{AttentionMaskBuilder, HeadSet, LayoutSpec, Routing, SegmentKind, TokenLayout};

fn layout(act: bool, fwd: bool, hand: bool, hand_rgb: bool, n: usize, chunk: usize) -> TokenLayout {
    TokenLayout::compute(&LayoutSpec {
        routing: Routing::new(HeadSet::from_flags(act, fwd, hand).unwrap(), hand_rgb),
        n_patch_latents: n,
        chunk_size: chunk,
    })
}

fn valid_flag_sets() -> Vec<(bool, bool, bool, bool)> {
    let mut sets = Vec::new();
    for bits in 0..16u8 {
        let flags = (bits & 1 != 0, bits & 2 != 0, bits & 4 != 0, bits & 8 != 0);
        if flags.2 && !flags.1 {
            continue;
        }
        sets.push(flags);
    }
    sets
}

#[test]
fn reference_scenario_without_hand_rgb() -> Result<()> {
    let layout = layout(true, true, false, false, 9, 10);
    assert_eq!(layout.content_tokens(), 12);
    assert_eq!(layout.total_per_step(), 32);
    assert_eq!(layout.query_tokens(), 20);

    let validity = Tensor::ones((2, 4), DType::F32, &Device::Cpu)?;
    let mask = AttentionMaskBuilder::build(&validity, &layout)?;
    assert_eq!(mask.dims(), &[2, 128]);
    Ok(())
}

#[test]
fn reference_scenario_with_hand_rgb() {
    let layout = layout(true, true, false, true, 9, 10);
    assert_eq!(layout.content_tokens(), 22);
    assert_eq!(layout.total_per_step(), 42);
    assert_eq!(layout.start(SegmentKind::HandPatch), Some(12));
    assert_eq!(layout.start(SegmentKind::HandObs), Some(21));
}

#[test]
fn totals_and_offsets_hold_for_every_valid_flag_set() {
    let (n, chunk) = (5, 7);
    for (act, fwd, hand, hand_rgb) in valid_flag_sets() {
        let layout = layout(act, fwd, hand, hand_rgb, n, chunk);

        let content = if hand_rgb { 2 * (n + 2) } else { n + 3 };
        let queries = [(act, chunk), (fwd, n + 1), (hand, n + 1)]
            .iter()
            .filter(|(enabled, _)| *enabled)
            .map(|(_, width)| width)
            .sum::<usize>();
        assert_eq!(layout.content_tokens(), content);
        assert_eq!(layout.total_per_step(), content + queries);

        let mut cursor = 0;
        for segment in layout.segments() {
            assert_eq!(segment.start, cursor, "gap before {:?}", segment.kind);
            assert!(segment.len > 0);
            cursor = segment.end();
        }
        assert_eq!(cursor, layout.total_per_step());
        assert!(layout
            .segments()
            .windows(2)
            .all(|pair| pair[0].start < pair[1].start));
    }
}

#[test]
fn disabling_hand_head_shrinks_step_by_one_observation_query() {
    let n = 9;
    let with_hand = layout(true, true, true, false, n, 10);
    let without_hand = layout(true, true, false, false, n, 10);
    assert_eq!(
        with_hand.total_per_step() - without_hand.total_per_step(),
        n + 1
    );
    assert!(without_hand.segment(SegmentKind::ObsHandQuery).is_none());
}

#[test]
fn mask_width_and_query_zeros_hold_for_every_valid_flag_set() -> Result<()> {
    let device = Device::Cpu;
    let (batch, time) = (2, 3);
    let validity = Tensor::new(&[[1f32, 0.0, 1.0], [1.0, 1.0, 0.0]], &device)?;
    let steps = validity.to_vec2::<f32>()?;

    for (act, fwd, hand, hand_rgb) in valid_flag_sets() {
        let layout = layout(act, fwd, hand, hand_rgb, 3, 4);
        let mask = AttentionMaskBuilder::build(&validity, &layout)?;
        assert_eq!(mask.dims(), &[batch, time * layout.total_per_step()]);

        let rows = mask.to_vec2::<u32>()?;
        for b in 0..batch {
            for t in 0..time {
                let base = t * layout.total_per_step();
                for segment in layout.segments() {
                    let expected = if segment.kind.is_query() {
                        0
                    } else {
                        steps[b][t] as u32
                    };
                    for offset in segment.start..segment.end() {
                        assert_eq!(rows[b][base + offset], expected, "{:?}", segment.kind);
                    }
                }
            }
        }
    }
    Ok(())
}
