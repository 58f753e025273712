//! Windowed merge of freshly retrieved samples into an existing buffer.
//!
//! The buffer is two position-aligned arrays: ascending timestamps (epoch
//! milliseconds) and values. Merging keeps the tail of the existing buffer
//! that is still inside the trailing window and appends the new samples after
//! it. The value array has no timestamps of its own, so the cut index found
//! on the time array is reused for it verbatim.

use crate::store::{BufferRef, BufferStore, StoreError};
use thiserror::Error;

/// Errors from a merge. All of these are recoverable per channel: the
/// channel's update is skipped for the cycle, nothing else is affected.
#[derive(Debug, Clone, Error)]
pub enum MergeError {
    /// The backing storage could not be grown to the merged size.
    #[error("buffer reallocation failed: {0}")]
    Alloc(String),

    /// Paired time/value arrays disagree in length.
    #[error("time/value arrays out of sync: {times} times vs {values} values")]
    Desynced { times: usize, values: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of one merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Buffer length after the merge.
    pub total: usize,
    /// Existing samples that survived the window cut.
    pub retained: usize,
}

/// Merge `new_x`/`new_y` into the existing `xs`/`ys` arrays under the window
/// policy: existing samples older than `now - seconds_past` are evicted, the
/// surviving tail keeps its order and the new samples follow it.
///
/// The merged arrays are built with exactly one reservation each; an
/// allocation failure leaves the input buffers untouched.
pub fn merge_window(
    xs: &mut Vec<f64>,
    ys: &mut Vec<f64>,
    new_x: &[f64],
    new_y: &[f64],
    seconds_past: u64,
    now: f64,
) -> Result<MergeOutcome, MergeError> {
    if xs.len() != ys.len() {
        return Err(MergeError::Desynced {
            times: xs.len(),
            values: ys.len(),
        });
    }
    if new_x.len() != new_y.len() {
        return Err(MergeError::Desynced {
            times: new_x.len(),
            values: new_y.len(),
        });
    }

    let window_start_ms = (now - seconds_past as f64) * 1000.0;
    // First element still inside the window; timestamps are ascending.
    let k = xs.partition_point(|&t| t < window_start_ms);
    let retained = xs.len() - k;
    let total = retained + new_x.len();

    let mut merged_x: Vec<f64> = Vec::new();
    merged_x
        .try_reserve_exact(total)
        .map_err(|e| MergeError::Alloc(e.to_string()))?;
    merged_x.extend_from_slice(&xs[k..]);
    merged_x.extend_from_slice(new_x);

    let mut merged_y: Vec<f64> = Vec::new();
    merged_y
        .try_reserve_exact(total)
        .map_err(|e| MergeError::Alloc(e.to_string()))?;
    // Same cut index as the time array, keeping the pair position-aligned.
    merged_y.extend_from_slice(&ys[k..]);
    merged_y.extend_from_slice(new_y);

    *xs = merged_x;
    *ys = merged_y;
    Ok(MergeOutcome { total, retained })
}

/// Merge new samples into the store pair behind `buf`, updating slot
/// metadata alongside. The store lock is held for the whole update so both
/// arrays change atomically with respect to the store's readers.
pub fn apply_update(
    store: &dyn BufferStore,
    buf: BufferRef,
    new_x: &[f64],
    new_y: &[f64],
    seconds_past: u64,
    now: f64,
    backend: &str,
) -> Result<MergeOutcome, MergeError> {
    let mut merge_result: Result<MergeOutcome, MergeError> = Ok(MergeOutcome {
        total: 0,
        retained: 0,
    });

    store.with_pair(buf, &mut |x_slot, y_slot| {
        merge_result = merge_window(
            &mut x_slot.data,
            &mut y_slot.data,
            new_x,
            new_y,
            seconds_past,
            now,
        );
        if merge_result.is_ok() {
            for meta in [&mut x_slot.meta, &mut y_slot.meta] {
                meta.backend = backend.to_string();
                meta.connected = true;
                meta.read_access = true;
                meta.write_access = false;
                meta.monitor_count += 1;
            }
        }
    })?;

    merge_result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryBufferStore, Slot};

    fn ascending_ms(now: f64, offsets_s: &[f64]) -> Vec<f64> {
        offsets_s.iter().map(|o| (now + o) * 1000.0).collect()
    }

    #[test]
    fn test_merge_within_window_keeps_everything() {
        // Window 3600s; ten existing points from 3500s to 620s ago, five new
        // points inside the last 600s. Nothing ages out: 10 + 5 = 15.
        let now = 1_700_000_000.0;
        let offsets: Vec<f64> = (0..10).map(|i| -3500.0 + i as f64 * 320.0).collect();
        let mut xs = ascending_ms(now, &offsets);
        let mut ys: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let new_x = ascending_ms(now, &[-500.0, -400.0, -300.0, -200.0, -100.0]);
        let new_y = vec![10.0, 11.0, 12.0, 13.0, 14.0];

        let outcome = merge_window(&mut xs, &mut ys, &new_x, &new_y, 3600, now).unwrap();
        assert_eq!(outcome.total, 15);
        assert_eq!(outcome.retained, 10);
        assert_eq!(xs.len(), ys.len());
        assert!(xs.windows(2).all(|w| w[0] <= w[1]), "timestamps ascending");
        assert_eq!(ys[14], 14.0);
    }

    #[test]
    fn test_merge_evicts_aged_out_samples() {
        let now = 1_700_000_000.0;
        let mut xs = ascending_ms(now, &[-7000.0, -5000.0, -1800.0, -600.0]);
        let mut ys = vec![1.0, 2.0, 3.0, 4.0];
        let new_x = ascending_ms(now, &[-60.0]);
        let new_y = vec![5.0];

        let outcome = merge_window(&mut xs, &mut ys, &new_x, &new_y, 3600, now).unwrap();
        // -7000s and -5000s are outside the 3600s window.
        assert_eq!(outcome.retained, 2);
        assert_eq!(outcome.total, 3);
        assert_eq!(ys, vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_merge_into_empty_buffer() {
        let now = 1_700_000_000.0;
        let mut xs = Vec::new();
        let mut ys = Vec::new();
        let new_x = ascending_ms(now, &[-10.0, -5.0]);
        let new_y = vec![1.0, 2.0];

        let outcome = merge_window(&mut xs, &mut ys, &new_x, &new_y, 3600, now).unwrap();
        assert_eq!(outcome.total, 2);
        assert_eq!(outcome.retained, 0);
    }

    #[test]
    fn test_merge_rejects_desynced_arrays() {
        let mut xs = vec![1.0, 2.0];
        let mut ys = vec![1.0];
        let err = merge_window(&mut xs, &mut ys, &[], &[], 3600, 0.0).unwrap_err();
        assert!(matches!(err, MergeError::Desynced { times: 2, values: 1 }));
        // Inputs untouched on failure.
        assert_eq!(xs.len(), 2);
    }

    #[test]
    fn test_apply_update_writes_metadata() {
        let now = 1_700_000_000.0;
        let store = MemoryBufferStore::new();
        store.insert(0, Slot::default());
        store.insert(1, Slot::default());
        let buf = BufferRef::new(0, 1);

        let new_x = ascending_ms(now, &[-10.0]);
        let outcome =
            apply_update(&store, buf, &new_x, &[42.0], 3600, now, "data-buffer").unwrap();
        assert_eq!(outcome.total, 1);

        let y = store.read(1).unwrap();
        assert_eq!(y.data, vec![42.0]);
        assert_eq!(y.meta.backend, "data-buffer");
        assert!(y.meta.connected);
        assert!(y.meta.read_access);
        assert!(!y.meta.write_access);
        assert_eq!(y.meta.monitor_count, 1);
    }

    #[test]
    fn test_apply_update_missing_slot_is_recoverable() {
        let store = MemoryBufferStore::new();
        store.insert(0, Slot::default());
        let err = apply_update(
            &store,
            BufferRef::new(0, 1),
            &[1.0],
            &[1.0],
            3600,
            0.0,
            "data-buffer",
        )
        .unwrap_err();
        assert!(matches!(err, MergeError::Store(_)));
    }
}
