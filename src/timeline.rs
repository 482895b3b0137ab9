use serde::{Deserialize, Serialize};

/// One trimmed span of the source, played back at `timescale` speed. Raw, unnormalized
/// input as it arrives in a `projectConfig`.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TimelineSegment {
    pub start: f64,
    pub end: f64,
    pub timescale: f64,
}

const MIN_SEGMENT_DURATION: f64 = 0.01;

/// Clamps every segment into `[0, duration]`, sorts by start, drops anything shorter
/// than 10ms, and substitutes a single full-length segment if nothing survives. This is
/// the one normalization pass every caller goes through before segments reach the
/// filter-graph builder, so the builder itself never has to handle malformed input.
pub fn normalize_segments(segments: &[TimelineSegment], duration: f64) -> Vec<TimelineSegment> {
    let mut normalized: Vec<TimelineSegment> = segments
        .iter()
        .map(|s| TimelineSegment {
            start: s.start.clamp(0.0, duration),
            end: s.end.clamp(0.0, duration),
            timescale: if s.timescale > 0.0 { s.timescale } else { 1.0 },
        })
        .filter(|s| s.end - s.start >= MIN_SEGMENT_DURATION)
        .collect();

    normalized.sort_by(|a, b| a.start.partial_cmp(&b.start).unwrap());

    if normalized.is_empty() {
        normalized.push(TimelineSegment {
            start: 0.0,
            end: duration.max(0.1),
            timescale: 1.0,
        });
    }

    normalized
}

pub fn total_duration(segments: &[TimelineSegment]) -> f64 {
    segments
        .iter()
        .map(|s| (s.end - s.start) / s.timescale)
        .sum::<f64>()
        .max(0.1)
}

/// Formats a float the way the filter-graph strings need it: up to 6 decimals, trailing
/// zeros stripped, so two equivalent filter graphs are always byte-identical.
pub fn fmt_num(value: f64) -> String {
    let s = format!("{value:.6}");
    let trimmed = s.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() || trimmed == "-0" {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Decomposes a timescale into a chain of `atempo` factors each within ffmpeg's
/// `[0.5, 2]` constraint.
fn atempo_chain(mut timescale: f64) -> Vec<f64> {
    let mut factors = Vec::new();
    while timescale > 2.0 {
        factors.push(2.0);
        timescale /= 2.0;
    }
    while timescale < 0.5 {
        factors.push(0.5);
        timescale /= 0.5;
    }
    if (timescale - 1.0).abs() > 1e-6 {
        factors.push(timescale);
    }
    factors
}

/// Builds the two concat filter graphs (video and audio) for a normalized segment
/// list. `video_input` and `audio_input` are the ffmpeg input stream indices the
/// segments are drawn from (normally both `0`).
#[derive(Debug, Serialize)]
pub struct FilterGraph {
    pub video_filter: String,
    pub audio_filter: String,
    pub video_label: String,
    pub audio_label: String,
}

pub fn build_filter_graph(segments: &[TimelineSegment], video_input: usize, audio_input: usize) -> FilterGraph {
    let n = segments.len();
    let mut video_parts = Vec::with_capacity(n);
    let mut video_labels = Vec::with_capacity(n);
    let mut audio_parts = Vec::with_capacity(n);
    let mut audio_labels = Vec::with_capacity(n);

    for (i, seg) in segments.iter().enumerate() {
        let vlabel = format!("v{i}");
        video_parts.push(format!(
            "[{video_input}:v]trim=start={}:end={},setpts=(PTS-STARTPTS)/{}[{vlabel}]",
            fmt_num(seg.start),
            fmt_num(seg.end),
            fmt_num(seg.timescale),
        ));
        video_labels.push(format!("[{vlabel}]"));

        let alabel = format!("a{i}");
        let mut chain = format!(
            "[{audio_input}:a]atrim=start={}:end={},asetpts=PTS-STARTPTS",
            fmt_num(seg.start),
            fmt_num(seg.end),
        );
        for factor in atempo_chain(seg.timescale) {
            chain.push_str(&format!(",atempo={}", fmt_num(factor)));
        }
        chain.push_str(&format!("[{alabel}]"));
        audio_parts.push(chain);
        audio_labels.push(format!("[{alabel}]"));
    }

    video_parts.push(format!(
        "{}concat=n={n}:v=1:a=0[vout]",
        video_labels.join("")
    ));
    audio_parts.push(format!(
        "{}concat=n={n}:v=0:a=1[aout]",
        audio_labels.join("")
    ));

    FilterGraph {
        video_filter: video_parts.join(";"),
        audio_filter: audio_parts.join(";"),
        video_label: "[vout]".to_string(),
        audio_label: "[aout]".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_sorts_and_drops_tiny_segments() {
        let segments = vec![
            TimelineSegment { start: -5.0, end: 2.0, timescale: 1.0 },
            TimelineSegment { start: 50.0, end: 50.005, timescale: 1.0 },
            TimelineSegment { start: 8.0, end: 100.0, timescale: 1.0 },
        ];
        let normalized = normalize_segments(&segments, 10.0);
        assert_eq!(normalized.len(), 2);
        assert_eq!(normalized[0].start, 0.0);
        assert_eq!(normalized[0].end, 2.0);
        assert_eq!(normalized[1].end, 10.0);
    }

    #[test]
    fn empty_input_substitutes_full_length_segment() {
        let normalized = normalize_segments(&[], 42.0);
        assert_eq!(normalized.len(), 1);
        assert_eq!(normalized[0].start, 0.0);
        assert_eq!(normalized[0].end, 42.0);
        assert_eq!(normalized[0].timescale, 1.0);
    }

    #[test]
    fn zero_duration_source_gets_minimum_span() {
        let normalized = normalize_segments(&[], 0.0);
        assert_eq!(normalized[0].end, 0.1);
    }

    #[test]
    fn fmt_num_strips_trailing_zeros() {
        assert_eq!(fmt_num(1.5), "1.5");
        assert_eq!(fmt_num(2.0), "2");
        assert_eq!(fmt_num(0.333333333), "0.333333");
        assert_eq!(fmt_num(0.0), "0");
    }

    #[test]
    fn atempo_chain_decomposes_out_of_range_factors() {
        let chain = atempo_chain(5.0);
        for f in &chain {
            assert!(*f >= 0.5 && *f <= 2.0);
        }
        let product: f64 = chain.iter().product();
        assert!((product - 5.0).abs() < 1e-6);
    }

    #[test]
    fn atempo_chain_skips_identity() {
        assert!(atempo_chain(1.0).is_empty());
    }

    #[test]
    fn filter_graph_concats_all_segments() {
        let segments = normalize_segments(
            &[
                TimelineSegment { start: 0.0, end: 2.0, timescale: 1.0 },
                TimelineSegment { start: 4.0, end: 6.0, timescale: 2.0 },
            ],
            10.0,
        );
        let graph = build_filter_graph(&segments, 0, 0);
        assert!(graph.video_filter.contains("concat=n=2:v=1:a=0[vout]"));
        assert!(graph.audio_filter.contains("concat=n=2:v=0:a=1[aout]"));
        assert!(graph.audio_filter.contains("atempo=2"));
    }
}
