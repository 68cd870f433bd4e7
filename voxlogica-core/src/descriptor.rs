//! Bounded, pageable views of materialized values.
//!
//! A descriptor is derived from a store record on demand and never
//! persisted. Whatever the payload size, the descriptor stays within the
//! configured limits: strings are prefixed, containers are paged, arrays
//! are summarized by stats and a small sample.

use crate::codec;
use crate::config::DescriptorLimits;
use crate::registry::OperatorRegistry;
use crate::store::{RecordStatus, StoreRecord};
use crate::value::{NdArray, VoxValue};
use crate::workplan::NodeId;
use serde::Serialize;
use serde_json::json;

/// One segment of an inspection path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathSeg {
    /// Mapping key.
    Key(String),
    /// Sequence index (base 10).
    Index(u64),
    /// Array element, `[i]`.
    ArrayIndex(u64),
    /// Array slice, `[i:j]` (half-open).
    ArraySlice(u64, u64),
}

/// Parse a `/`-separated path. Empty segments are ignored, so `a//b` and
/// `/a/b/` are tolerated.
pub fn parse_path(path: &str) -> Result<Vec<PathSeg>, String> {
    let mut segments = Vec::new();
    for raw in path.split('/') {
        if raw.is_empty() {
            continue;
        }
        if let Some(body) = raw.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
            if let Some((lo, hi)) = body.split_once(':') {
                let lo: u64 = lo.parse().map_err(|_| format!("bad slice `{raw}`"))?;
                let hi: u64 = hi.parse().map_err(|_| format!("bad slice `{raw}`"))?;
                if hi < lo {
                    return Err(format!("empty slice `{raw}`"));
                }
                segments.push(PathSeg::ArraySlice(lo, hi));
            } else {
                let idx: u64 = body.parse().map_err(|_| format!("bad index `{raw}`"))?;
                segments.push(PathSeg::ArrayIndex(idx));
            }
        } else if raw.bytes().all(|b| b.is_ascii_digit()) {
            let idx: u64 = raw.parse().map_err(|_| format!("bad index `{raw}`"))?;
            segments.push(PathSeg::Index(idx));
        } else {
            segments.push(PathSeg::Key(raw.to_string()));
        }
    }
    Ok(segments)
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PageRequest {
    pub offset: usize,
    /// Requested page size; clipped to the configured maximum.
    pub size: Option<usize>,
}

#[derive(Clone, Debug, Serialize)]
pub struct Navigation {
    pub path: String,
    pub pageable: bool,
    pub can_descend: bool,
    pub default_page_size: usize,
    pub max_page_size: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct Render {
    pub kind: &'static str,
    pub url: String,
}

/// The bounded view returned by inspection APIs.
#[derive(Clone, Debug, Serialize)]
pub struct Descriptor {
    pub vox_type: String,
    pub format_version: u8,
    pub summary: serde_json::Value,
    pub navigation: Navigation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub render: Option<Render>,
}

/// Builds descriptors under the configured limits. The registry reference
/// materializes lazy `Map` plan pages.
pub struct DescriptorBuilder<'a> {
    limits: &'a DescriptorLimits,
    registry: &'a OperatorRegistry,
}

impl<'a> DescriptorBuilder<'a> {
    pub fn new(limits: &'a DescriptorLimits, registry: &'a OperatorRegistry) -> Self {
        Self { limits, registry }
    }

    /// Descriptor for a store record, rooted at `path`.
    pub fn from_record(&self, record: &StoreRecord, path: &str, page: PageRequest) -> Descriptor {
        match record.status {
            RecordStatus::Failed | RecordStatus::Killed => {
                self.error(&record.failure_message(), path)
            }
            RecordStatus::Materialized => {
                let Some(payload) = record.payload.as_deref() else {
                    return self.error("record has no payload", path);
                };
                match codec::decode(payload) {
                    Ok(value) => self.from_value(&value, record.node_id, path, page),
                    Err(e) => self.error(&format!("undecodable payload: {e}"), path),
                }
            }
        }
    }

    /// Descriptor for an already-decoded value.
    pub fn from_value(
        &self,
        value: &VoxValue,
        node_id: NodeId,
        path: &str,
        page: PageRequest,
    ) -> Descriptor {
        let segments = match parse_path(path) {
            Ok(segments) => segments,
            Err(e) => return self.error(&e, path),
        };
        match self.navigate(value, &segments) {
            Ok(target) => self.describe(&target, node_id, path, page),
            Err(e) => self.error(&e, path),
        }
    }

    /// An `error`-typed descriptor. Invalid paths and failed records both
    /// land here without failing the request.
    pub fn error(&self, message: &str, path: &str) -> Descriptor {
        Descriptor {
            vox_type: "error".to_string(),
            format_version: codec::FORMAT_VERSION,
            summary: json!({ "message": message }),
            navigation: Navigation {
                path: path.to_string(),
                pageable: false,
                can_descend: false,
                default_page_size: self.limits.default_page_size,
                max_page_size: self.limits.max_page_size,
            },
            render: None,
        }
    }

    fn navigate(&self, value: &VoxValue, segments: &[PathSeg]) -> Result<VoxValue, String> {
        let mut current = value.clone();
        for segment in segments {
            current = match (&current, segment) {
                (VoxValue::Map(map), PathSeg::Key(key)) => map
                    .get(key)
                    .cloned()
                    .ok_or_else(|| format!("no key `{key}`"))?,
                (VoxValue::Seq(items), PathSeg::Index(idx)) => items
                    .get(*idx as usize)
                    .cloned()
                    .ok_or_else(|| format!("index {idx} out of range"))?,
                (VoxValue::Lazy(plan), PathSeg::Index(idx)) => plan
                    .element(*idx, &|name, v| self.registry.apply_unary_sync(name, v))
                    .map_err(|e| e.to_string())?,
                (VoxValue::Array(arr), PathSeg::ArrayIndex(idx)) => {
                    let v = arr
                        .get_f64(*idx as usize)
                        .ok_or_else(|| format!("index {idx} out of range"))?;
                    VoxValue::Float(v)
                }
                (VoxValue::Array(arr), PathSeg::ArraySlice(lo, hi)) => {
                    let hi = (*hi).min(arr.element_count());
                    let items: Vec<VoxValue> = (*lo..hi)
                        .filter_map(|i| arr.get_f64(i as usize))
                        .map(VoxValue::Float)
                        .collect();
                    VoxValue::Seq(items)
                }
                (other, segment) => {
                    return Err(format!(
                        "cannot descend into {} with `{segment:?}`",
                        other.vox_type()
                    ))
                }
            };
        }
        Ok(current)
    }

    fn page_size(&self, page: PageRequest) -> usize {
        page.size
            .unwrap_or(self.limits.default_page_size)
            .min(self.limits.max_page_size)
            .max(1)
    }

    fn describe(
        &self,
        value: &VoxValue,
        node_id: NodeId,
        path: &str,
        page: PageRequest,
    ) -> Descriptor {
        let mut navigation = Navigation {
            path: path.to_string(),
            pageable: false,
            can_descend: false,
            default_page_size: self.limits.default_page_size,
            max_page_size: self.limits.max_page_size,
        };
        let mut render = None;

        let summary = match value {
            VoxValue::Null | VoxValue::Bool(_) | VoxValue::Int(_) | VoxValue::Float(_) => {
                json!({ "value": value.to_display_json() })
            }
            VoxValue::Str(s) => {
                let truncated = s.len() > self.limits.string_prefix;
                let prefix: String = if truncated {
                    // Cut on a char boundary at or below the byte limit.
                    let mut end = self.limits.string_prefix;
                    while !s.is_char_boundary(end) {
                        end -= 1;
                    }
                    s[..end].to_string()
                } else {
                    s.clone()
                };
                json!({ "value": prefix, "length": s.len(), "truncated": truncated })
            }
            VoxValue::Bytes(b) => json!({ "length": b.len() }),
            VoxValue::Seq(items) => {
                navigation.pageable = true;
                navigation.can_descend = true;
                let size = self.page_size(page);
                let page_items: Vec<serde_json::Value> = items
                    .iter()
                    .skip(page.offset)
                    .take(size)
                    .map(|v| self.short(v))
                    .collect();
                let next_offset = page.offset + page_items.len();
                json!({
                    "length": items.len(),
                    "page": {
                        "offset": page.offset,
                        "items": page_items,
                        "next_offset": if next_offset < items.len() { Some(next_offset) } else { None },
                    }
                })
            }
            VoxValue::Map(map) => {
                navigation.pageable = true;
                navigation.can_descend = true;
                let size = self.page_size(page);
                let entries: Vec<serde_json::Value> = map
                    .iter()
                    .skip(page.offset)
                    .take(size)
                    .map(|(k, v)| json!({ "key": k, "value": self.short(v) }))
                    .collect();
                let next_offset = page.offset + entries.len();
                json!({
                    "length": map.len(),
                    "page": {
                        "offset": page.offset,
                        "items": entries,
                        "next_offset": if next_offset < map.len() { Some(next_offset) } else { None },
                    }
                })
            }
            VoxValue::Lazy(plan) => {
                navigation.pageable = true;
                navigation.can_descend = true;
                let size = self.page_size(page);
                let total = plan.len();
                let end = (page.offset as u64 + size as u64).min(total);
                let mut items = Vec::new();
                for index in page.offset as u64..end {
                    match plan.element(index, &|name, v| self.registry.apply_unary_sync(name, v)) {
                        Ok(v) => items.push(self.short(&v)),
                        Err(e) => items.push(json!({ "error": e.to_string() })),
                    }
                }
                let next_offset = page.offset as u64 + items.len() as u64;
                json!({
                    "length": total,
                    "lazy": true,
                    "page": {
                        "offset": page.offset,
                        "items": items,
                        "next_offset": if next_offset < total { Some(next_offset) } else { None },
                    }
                })
            }
            VoxValue::Array(arr) => {
                navigation.can_descend = true;
                if arr.shape.len() == 2 {
                    render = Some(Render {
                        kind: "png",
                        url: render_url(node_id, path, "png"),
                    });
                } else if arr.shape.len() == 3 {
                    render = Some(Render {
                        kind: "volume",
                        url: render_url(node_id, path, "volume"),
                    });
                }
                array_summary(arr, self.limits.array_sample)
            }
            VoxValue::Image(image) => {
                render = Some(Render {
                    kind: "png",
                    url: render_url(node_id, path, "png"),
                });
                json!({
                    "width": image.width,
                    "height": image.height,
                    "channels": image.channels,
                    "dtype": image.dtype.name(),
                })
            }
            VoxValue::Volume(volume) => {
                render = Some(Render {
                    kind: "volume",
                    url: render_url(node_id, path, "volume"),
                });
                json!({
                    "width": volume.width,
                    "height": volume.height,
                    "depth": volume.depth,
                    "dtype": volume.dtype.name(),
                })
            }
            VoxValue::Opaque(opaque) => json!({ "type": opaque.type_name }),
        };

        Descriptor {
            vox_type: value.vox_type().to_string(),
            format_version: codec::FORMAT_VERSION,
            summary,
            navigation,
            render,
        }
    }

    /// One-line rendering of an item inside a page: full scalars, shape
    /// notes for anything bulky.
    fn short(&self, value: &VoxValue) -> serde_json::Value {
        match value {
            VoxValue::Null
            | VoxValue::Bool(_)
            | VoxValue::Int(_)
            | VoxValue::Float(_) => value.to_display_json(),
            VoxValue::Str(s) => {
                if s.len() <= 64 {
                    json!(s)
                } else {
                    json!({ "vox_type": "string", "length": s.len() })
                }
            }
            other => json!({ "vox_type": other.vox_type() }),
        }
    }
}

fn render_url(node_id: NodeId, path: &str, kind: &str) -> String {
    if path.is_empty() {
        format!("/api/v1/store/{node_id}/render?kind={kind}")
    } else {
        format!("/api/v1/store/{node_id}/render?kind={kind}&path={path}")
    }
}

fn array_summary(arr: &NdArray, sample_cap: usize) -> serde_json::Value {
    let count = arr.element_count();
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    let mut sum = 0.0;
    for v in arr.iter_f64() {
        min = min.min(v);
        max = max.max(v);
        sum += v;
    }
    // Stride sampling for a sparkline.
    let stride = (count as usize / sample_cap.max(1)).max(1);
    let sample: Vec<f64> = (0..count as usize)
        .step_by(stride)
        .take(sample_cap)
        .filter_map(|i| arr.get_f64(i))
        .collect();
    if count == 0 {
        json!({ "dtype": arr.dtype.name(), "shape": arr.shape, "sample": sample })
    } else {
        json!({
            "dtype": arr.dtype.name(),
            "shape": arr.shape,
            "min": min,
            "max": max,
            "mean": sum / count as f64,
            "sample": sample,
        })
    }
}
