//! Per-session persistence, §3.9 and §4.11.
//!
//! Layout under `<out>/<session_id>/`: `meta.json`, `index.json`, and
//! `tracks/seg-NNNN.jsonl`. `meta.json`/`index.json` are rewritten via
//! write-temp-then-rename (`tempfile::NamedTempFile::persist`), giving
//! W2 (no reader ever observes a partial file) without a bespoke lock
//! file — the corpus's own `flydra2::write_data::WritingState` instead
//! holds a `readme_fd` open for locking, but introduces no atomic-rename
//! helper of its own; `tempfile` is already a workspace dependency and is
//! the idiomatic substitute.

use std::fs::File;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub session_id: String,
    pub device_id: String,
    pub start_time: String,
    pub end_time: Option<String>,
    pub frame_count: u64,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    pub class_catalog: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub i: u32,
    pub t0_s: f64,
    pub t1_s: f64,
    pub url: String,
    pub count: u64,
    pub closed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionIndex {
    pub segment_duration_s: f64,
    pub segments: Vec<SegmentRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackObject {
    pub track_id: u64,
    pub cls_id: usize,
    pub cls_name: String,
    pub conf: f32,
    /// `[x1, y1, x2, y2]`, normalized to `[0, 1]` by image dimensions.
    pub bbox_xyxy: [f32; 4],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackLine {
    pub t_rel_s: f64,
    pub frame_id: u64,
    pub ts_mono_ns: u64,
    pub ts_utc_ns: u64,
    pub objs: Vec<TrackObject>,
}

fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    let body = serde_json::to_vec_pretty(value)?;
    tmp.write_all(&body)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

struct OpenSegment {
    idx: u32,
    file: File,
    t0_s: f64,
    count: u64,
}

/// Owns one session's on-disk artifacts. A connection holds at most one of
/// these open at a time (§5, "Session writer: owned by a single
/// connection").
pub struct SessionWriter {
    base_dir: PathBuf,
    meta: SessionMeta,
    segment_duration_s: f64,
    segments: Vec<SegmentRecord>,
    current: Option<OpenSegment>,
    session_start_mono_ns: Option<u64>,
    session_start_utc_ns: u64,
}

impl SessionWriter {
    /// Creates `<out_dir>/<session_id>/` and its `tracks/` subdir, and
    /// writes an initial `meta.json`/`index.json` pair.
    pub fn create(
        out_dir: &Path,
        session_id: &str,
        device_id: &str,
        width: u32,
        height: u32,
        fps: f64,
        segment_duration_s: f64,
        session_start_mono_ns: u64,
        session_start_utc_ns: u64,
    ) -> Result<Self> {
        let base_dir = out_dir.join(session_id);
        std::fs::create_dir_all(base_dir.join("tracks"))?;

        let start_time = datetime_conversion::f64_to_datetime(session_start_utc_ns as f64 / 1e9)
            .to_rfc3339();

        let meta = SessionMeta {
            session_id: session_id.to_string(),
            device_id: device_id.to_string(),
            start_time,
            end_time: None,
            frame_count: 0,
            fps,
            width,
            height,
            class_catalog: Vec::new(),
        };

        let writer = Self {
            base_dir,
            meta,
            segment_duration_s,
            segments: Vec::new(),
            current: None,
            session_start_mono_ns: Some(session_start_mono_ns),
            session_start_utc_ns,
        };
        writer.write_meta()?;
        writer.write_index()?;
        Ok(writer)
    }

    fn meta_path(&self) -> PathBuf {
        self.base_dir.join("meta.json")
    }

    fn index_path(&self) -> PathBuf {
        self.base_dir.join("index.json")
    }

    fn write_meta(&self) -> Result<()> {
        write_atomic(&self.meta_path(), &self.meta)
    }

    fn write_index(&self) -> Result<()> {
        let index = SessionIndex {
            segment_duration_s: self.segment_duration_s,
            segments: self.segments.clone(),
        };
        write_atomic(&self.index_path(), &index)
    }

    fn t_rel_s(&self, ts_mono_ns: u64, ts_utc_ns: u64) -> f64 {
        match self.session_start_mono_ns {
            Some(start) => (ts_mono_ns.saturating_sub(start)) as f64 / 1e9,
            None => (ts_utc_ns.saturating_sub(self.session_start_utc_ns)) as f64 / 1e9,
        }
    }

    fn seg_path(base_dir: &Path, idx: u32) -> PathBuf {
        base_dir.join("tracks").join(format!("seg-{idx:04}.jsonl"))
    }

    /// Closes the currently open segment (if any), marking it `closed` in
    /// the in-memory index. Does not rewrite `index.json`; callers batch
    /// that with whatever triggered the close.
    fn close_current_segment(&mut self, t_rel_s: f64) -> Result<()> {
        if let Some(seg) = self.current.take() {
            seg.file.sync_all()?;
            if let Some(record) = self.segments.iter_mut().find(|s| s.i == seg.idx) {
                record.t1_s = t_rel_s;
                record.count = seg.count;
                record.closed = true;
            }
        }
        Ok(())
    }

    fn ensure_segment(&mut self, t_rel_s: f64) -> Result<()> {
        let idx = (t_rel_s / self.segment_duration_s).floor().max(0.0) as u32;
        if let Some(seg) = &self.current {
            if seg.idx == idx {
                return Ok(());
            }
        }
        self.close_current_segment(t_rel_s)?;

        let path = Self::seg_path(&self.base_dir, idx);
        let file = File::create(&path)?;
        self.segments.push(SegmentRecord {
            i: idx,
            t0_s: t_rel_s,
            t1_s: t_rel_s,
            url: format!("tracks/seg-{idx:04}.jsonl"),
            count: 0,
            closed: false,
        });
        self.current = Some(OpenSegment {
            idx,
            file,
            t0_s: t_rel_s,
            count: 0,
        });
        Ok(())
    }

    /// Appends one line of tracks for `frame_id` (the wire value, per S2),
    /// rolling segments per S1. Bboxes are normalized by `(image_width,
    /// image_height)`.
    pub fn append(
        &mut self,
        frame_id: u64,
        ts_mono_ns: u64,
        ts_utc_ns: u64,
        image_width: u32,
        image_height: u32,
        objs: &[(u64, usize, String, f32, [f32; 4])],
    ) -> Result<()> {
        if objs.is_empty() {
            return Ok(());
        }
        let t_rel_s = self.t_rel_s(ts_mono_ns, ts_utc_ns);
        self.ensure_segment(t_rel_s)?;

        let w = image_width.max(1) as f32;
        let h = image_height.max(1) as f32;
        let line = TrackLine {
            t_rel_s,
            frame_id,
            ts_mono_ns,
            ts_utc_ns,
            objs: objs
                .iter()
                .map(|(track_id, cls_id, cls_name, conf, bbox)| TrackObject {
                    track_id: *track_id,
                    cls_id: *cls_id,
                    cls_name: cls_name.clone(),
                    conf: (*conf * 10_000.0).round() / 10_000.0,
                    bbox_xyxy: [
                        bbox[0] / w,
                        bbox[1] / h,
                        bbox[2] / w,
                        bbox[3] / h,
                    ],
                })
                .collect(),
        };

        for name in &line.objs {
            if !self.meta.class_catalog.iter().any(|c| c == &name.cls_name) {
                self.meta.class_catalog.push(name.cls_name.clone());
            }
        }

        let mut json = serde_json::to_vec(&line)?;
        json.push(b'\n');

        let seg = self.current.as_mut().expect("ensure_segment just opened one");
        seg.file.write_all(&json)?;
        seg.count += 1;
        if let Some(record) = self.segments.iter_mut().find(|s| s.i == seg.idx) {
            record.count = seg.count;
            record.t1_s = t_rel_s;
        }

        self.meta.frame_count += 1;
        self.write_meta()?;
        self.write_index()?;
        Ok(())
    }

    /// Flushes and closes the current segment, marks the session's end
    /// time, and atomically rewrites `meta.json`/`index.json` (W1, W2).
    pub fn close(mut self, end_time: String) -> Result<()> {
        let last_t_rel_s = self
            .current
            .as_ref()
            .map(|s| s.t0_s)
            .unwrap_or(0.0);
        self.close_current_segment(last_t_rel_s)?;
        self.meta.end_time = Some(end_time);
        self.write_meta()?;
        self.write_index()?;
        Ok(())
    }
}

fn last_write_time(session_dir: &Path) -> Option<String> {
    let metadata = std::fs::metadata(session_dir).ok()?;
    let modified = metadata.modified().ok()?;
    let datetime: chrono::DateTime<chrono::Utc> = modified.into();
    Some(datetime.to_rfc3339())
}

/// Closes any session directory left open by a prior crash: one whose
/// `meta.json` has no `end_time`. Run once at worker startup (§7,
/// "sessions that were ACTIVE when a worker crashes are closed by the
/// worker on next startup sweep").
pub fn sweep_stale_sessions(out_dir: &Path) -> Result<usize> {
    if !out_dir.exists() {
        return Ok(0);
    }
    let mut swept = 0;
    for entry in std::fs::read_dir(out_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let session_dir = entry.path();
        let meta_path = session_dir.join("meta.json");
        let Ok(text) = std::fs::read_to_string(&meta_path) else {
            continue;
        };
        let Ok(mut meta) = serde_json::from_str::<SessionMeta>(&text) else {
            continue;
        };
        if meta.end_time.is_some() {
            continue;
        }

        meta.end_time = Some(
            last_write_time(&session_dir).unwrap_or_else(|| chrono::Utc::now().to_rfc3339()),
        );
        write_atomic(&meta_path, &meta)?;

        let index_path = session_dir.join("index.json");
        if let Ok(index_text) = std::fs::read_to_string(&index_path) {
            if let Ok(mut index) = serde_json::from_str::<SessionIndex>(&index_text) {
                for seg in index.segments.iter_mut() {
                    seg.closed = true;
                }
                write_atomic(&index_path, &index)?;
            }
        }
        swept += 1;
        tracing::info!(session_id = %meta.session_id, "closed stale session on startup sweep");
    }
    Ok(swept)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_rolls_segments_by_floor_of_t_rel_over_duration() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SessionWriter::create(
            dir.path(),
            "sess-1",
            "device-1",
            640,
            480,
            15.0,
            2.0,
            0,
            0,
        )
        .unwrap();

        // t_rel_s = 0 -> seg 0; t_rel_s = 3 -> seg 1.
        writer
            .append(0, 0, 0, 640, 480, &[(1, 0, "person".into(), 0.9, [0.0, 0.0, 64.0, 48.0])])
            .unwrap();
        writer
            .append(
                3,
                3_000_000_000,
                3_000_000_000,
                640,
                480,
                &[(1, 0, "person".into(), 0.9, [0.0, 0.0, 64.0, 48.0])],
            )
            .unwrap();

        assert!(dir.path().join("sess-1/tracks/seg-0000.jsonl").exists());
        assert!(dir.path().join("sess-1/tracks/seg-0001.jsonl").exists());
    }

    #[test]
    fn append_writes_frame_id_verbatim_and_normalizes_bbox() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SessionWriter::create(
            dir.path(), "sess-2", "device-1", 100, 100, 15.0, 60.0, 0, 0,
        )
        .unwrap();
        writer
            .append(
                42,
                0,
                0,
                100,
                100,
                &[(7, 0, "car".into(), 0.87654, [10.0, 10.0, 50.0, 50.0])],
            )
            .unwrap();

        let text =
            std::fs::read_to_string(dir.path().join("sess-2/tracks/seg-0000.jsonl")).unwrap();
        let line: TrackLine = serde_json::from_str(text.trim()) .unwrap();
        assert_eq!(line.frame_id, 42);
        assert_eq!(line.objs[0].track_id, 7);
        assert_eq!(line.objs[0].bbox_xyxy, [0.1, 0.1, 0.5, 0.5]);
        assert_eq!(line.objs[0].conf, 0.8765);
    }

    #[test]
    fn frames_with_no_tracks_do_not_append_a_line() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer =
            SessionWriter::create(dir.path(), "sess-3", "device-1", 100, 100, 15.0, 60.0, 0, 0)
                .unwrap();
        writer.append(1, 0, 0, 100, 100, &[]).unwrap();
        assert!(!dir.path().join("sess-3/tracks/seg-0000.jsonl").exists());
    }

    #[test]
    fn close_sets_end_time_and_meta_is_well_formed_json() {
        let dir = tempfile::tempdir().unwrap();
        let writer =
            SessionWriter::create(dir.path(), "sess-4", "device-1", 100, 100, 15.0, 60.0, 0, 0)
                .unwrap();
        writer.close("2026-01-01T00:00:00Z".to_string()).unwrap();

        let text = std::fs::read_to_string(dir.path().join("sess-4/meta.json")).unwrap();
        let meta: SessionMeta = serde_json::from_str(&text).unwrap();
        assert_eq!(meta.end_time.as_deref(), Some("2026-01-01T00:00:00Z"));
    }

    #[test]
    fn sweep_closes_sessions_with_no_end_time() {
        let dir = tempfile::tempdir().unwrap();
        let writer =
            SessionWriter::create(dir.path(), "sess-5", "device-1", 100, 100, 15.0, 60.0, 0, 0)
                .unwrap();
        drop(writer); // simulate crash: never called close()

        let swept = sweep_stale_sessions(dir.path()).unwrap();
        assert_eq!(swept, 1);

        let text = std::fs::read_to_string(dir.path().join("sess-5/meta.json")).unwrap();
        let meta: SessionMeta = serde_json::from_str(&text).unwrap();
        assert!(meta.end_time.is_some());
    }

    #[test]
    fn sweep_leaves_already_closed_sessions_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let writer =
            SessionWriter::create(dir.path(), "sess-6", "device-1", 100, 100, 15.0, 60.0, 0, 0)
                .unwrap();
        writer.close("2026-01-01T00:00:00Z".to_string()).unwrap();

        let swept = sweep_stale_sessions(dir.path()).unwrap();
        assert_eq!(swept, 0);
    }
}
