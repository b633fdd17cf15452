use crate::domain::jobs::Segment;
use crate::error::SegmentationError;

/// Suffix replacing the source extension on the assembled artifact.
pub const FINAL_ARTIFACT_SUFFIX: &str = "-output.mp4";

/// Split `[0, duration)` into consecutive windows of `segment_size` seconds.
///
/// Returns one segment per window starting before `duration`, which is
/// `ceil(duration / segment_size)` up to float rounding of that quotient
/// (`0.30000000000000004 / 0.1` rounds up past 3 but yields three windows).
/// The last segment may be shorter and is never dropped or padded. A zero
/// duration yields no segments.
/// Boundaries are fixed intervals, not keyframes, so cut points can show
/// discontinuities after container-level concatenation.
pub fn segments(duration: f64, segment_size: f64) -> Result<Vec<Segment>, SegmentationError> {
    if !(segment_size.is_finite() && segment_size > 0.0) {
        return Err(SegmentationError::InvalidSegmentSize(segment_size));
    }
    if !(duration.is_finite() && duration >= 0.0) {
        return Err(SegmentationError::InvalidDuration(duration));
    }

    let mut count = (duration / segment_size).ceil() as usize;
    // The quotient can round up past the last window that starts before `duration`.
    while count > 0 && (count - 1) as f64 * segment_size >= duration {
        count -= 1;
    }
    let mut segments: Vec<Segment> = (0..count)
        .map(|index| {
            let start = index as f64 * segment_size;
            // (index + 1) * size rather than start + size keeps neighbours bit-identical
            let end = ((index + 1) as f64 * segment_size).min(duration);
            Segment { index, start, end }
        })
        .collect();

    if let Some(last) = segments.last_mut() {
        last.end = duration;
    }

    Ok(segments)
}

/// Storage key of the intermediate artifact for `segment`: `{start}-{end}-{source_key}`.
pub fn segment_artifact_key(segment: &Segment, source_key: &str) -> String {
    format!("{}-{}-{}", segment.start, segment.end, source_key)
}

/// Storage key of the assembled artifact: the source key with the extension of
/// its last path component stripped, suffixed with `-output.mp4`.
pub fn final_artifact_key(source_key: &str) -> String {
    let name_start = source_key.rfind('/').map_or(0, |slash| slash + 1);
    let stem_end = match source_key[name_start..].rfind('.') {
        Some(dot) if dot > 0 => name_start + dot,
        _ => source_key.len(),
    };
    format!("{}{}", &source_key[..stem_end], FINAL_ARTIFACT_SUFFIX)
}
