//! Haar cascade face detector.
//!
//! Evaluates boosted Haar cascades stored in OpenCV's XML format
//! (`haarcascade_frontalface_default.xml` and friends) over an image
//! pyramid, then merges overlapping hits the way OpenCV's
//! `groupRectangles` does.

use crate::types::FaceRect;
use image::imageops::{self, FilterType};
use image::GrayImage;
use roxmltree::Node;
use std::borrow::Cow;
use std::path::Path;
use thiserror::Error;

// --- Defaults matching the classic `detectMultiScale(grey, 1.3, 5)` call ---
pub const DEFAULT_SCALE_FACTOR: f32 = 1.3;
pub const DEFAULT_MIN_NEIGHBORS: usize = 5;
/// Relative tolerance used when clustering raw window hits.
const GROUP_EPS: f64 = 0.2;
/// `area / sqrt(variance norm)`; at or above this a window is too flat to classify.
const MIN_CONTRAST_RATIO: f64 = 0.1;

#[derive(Error, Debug)]
pub enum CascadeError {
    #[error("cascade file not found: {0} (expected an OpenCV haarcascade XML file)")]
    NotFound(String),
    #[error("failed to read cascade {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("cascade XML is malformed: {0}")]
    Parse(String),
    #[error("invalid cascade: {0}")]
    Format(String),
    #[error("unsupported cascade: {0}")]
    Unsupported(String),
    #[error("invalid detection parameters: {0}")]
    InvalidParams(String),
}

/// Anything that finds face rectangles in a grayscale frame.
///
/// Implementations may keep state between frames, hence `&mut self`.
pub trait FaceDetector {
    fn detect(&mut self, gray: &GrayImage) -> Vec<FaceRect>;
}

/// Multi-scale search parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectParams {
    /// Pyramid step between scales; must be greater than 1.
    pub scale_factor: f32,
    /// A cluster needs more than this many raw hits to be reported.
    pub min_neighbors: usize,
    /// Smallest face reported, in frame pixels. Defaults to the cascade window.
    pub min_size: Option<(u32, u32)>,
}

impl Default for DetectParams {
    fn default() -> Self {
        Self {
            scale_factor: DEFAULT_SCALE_FACTOR,
            min_neighbors: DEFAULT_MIN_NEIGHBORS,
            min_size: None,
        }
    }
}

#[derive(Debug, Clone)]
struct WeightedRect {
    x: usize,
    y: usize,
    width: usize,
    height: usize,
    weight: f64,
}

#[derive(Debug, Clone)]
struct HaarFeature {
    rects: Vec<WeightedRect>,
}

impl HaarFeature {
    fn value(&self, ii: &Integral, x: usize, y: usize) -> f64 {
        self.rects
            .iter()
            .map(|r| r.weight * ii.sum(x + r.x, y + r.y, r.width, r.height) as f64)
            .sum()
    }
}

/// One split of a weak classifier tree. Child indices `<= 0` address leaves.
#[derive(Debug, Clone)]
struct TreeNode {
    left: i32,
    right: i32,
    feature: usize,
    threshold: f64,
}

#[derive(Debug, Clone)]
struct WeakClassifier {
    nodes: Vec<TreeNode>,
    leaves: Vec<f64>,
}

#[derive(Debug, Clone)]
struct Stage {
    threshold: f64,
    classifiers: Vec<WeakClassifier>,
}

/// A loaded boosted Haar cascade.
#[derive(Debug, Clone)]
pub struct HaarCascade {
    window_width: usize,
    window_height: usize,
    stages: Vec<Stage>,
    features: Vec<HaarFeature>,
    params: DetectParams,
}

impl HaarCascade {
    /// Load a cascade from an OpenCV XML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CascadeError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(CascadeError::NotFound(path.display().to_string()));
        }
        let xml = std::fs::read_to_string(path).map_err(|source| CascadeError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let cascade = Self::from_xml(&xml)?;

        tracing::info!(
            path = %path.display(),
            window = ?cascade.window_size(),
            stages = cascade.stages.len(),
            features = cascade.features.len(),
            "loaded Haar cascade"
        );

        Ok(cascade)
    }

    /// Parse a cascade from OpenCV's (post-2.4) XML representation.
    pub fn from_xml(xml: &str) -> Result<Self, CascadeError> {
        let doc = roxmltree::Document::parse(xml).map_err(|e| CascadeError::Parse(e.to_string()))?;
        let root = doc
            .descendants()
            .find(|n| n.has_tag_name("cascade"))
            .ok_or_else(|| {
                CascadeError::Format(
                    "missing <cascade> element (old-style cascades are not supported)".into(),
                )
            })?;

        let feature_type = child_text(root, "featureType")?;
        if !feature_type.eq_ignore_ascii_case("HAAR") {
            return Err(CascadeError::Unsupported(format!(
                "feature type {feature_type} (only HAAR is supported)"
            )));
        }
        if let Some(stage_type) = child(root, "stageType") {
            let stage_type = stage_type.text().unwrap_or("").trim();
            if !stage_type.eq_ignore_ascii_case("BOOST") {
                return Err(CascadeError::Unsupported(format!("stage type {stage_type}")));
            }
        }

        let window_width: usize = parse_scalar(root, "width")?;
        let window_height: usize = parse_scalar(root, "height")?;
        if window_width < 3 || window_height < 3 {
            return Err(CascadeError::Format(format!(
                "window {window_width}x{window_height} is too small"
            )));
        }

        let stages = required_child(root, "stages")?
            .children()
            .filter(|n| n.is_element())
            .map(parse_stage)
            .collect::<Result<Vec<_>, _>>()?;
        let features = required_child(root, "features")?
            .children()
            .filter(|n| n.is_element())
            .map(parse_feature)
            .collect::<Result<Vec<_>, _>>()?;

        let cascade = Self {
            window_width,
            window_height,
            stages,
            features,
            params: DetectParams::default(),
        };
        cascade.check()?;
        Ok(cascade)
    }

    /// Replace the multi-scale search parameters.
    pub fn with_params(mut self, params: DetectParams) -> Result<Self, CascadeError> {
        if !(params.scale_factor > 1.0) {
            return Err(CascadeError::InvalidParams(format!(
                "scale factor must be > 1, got {}",
                params.scale_factor
            )));
        }
        self.params = params;
        Ok(self)
    }

    /// Training window size (width, height) in pixels.
    pub fn window_size(&self) -> (u32, u32) {
        (self.window_width as u32, self.window_height as u32)
    }

    /// Check every cross reference so evaluation can index without bounds surprises.
    fn check(&self) -> Result<(), CascadeError> {
        if self.stages.is_empty() {
            return Err(CascadeError::Format("cascade has no stages".into()));
        }
        for feature in &self.features {
            for r in &feature.rects {
                if r.x + r.width > self.window_width || r.y + r.height > self.window_height {
                    return Err(CascadeError::Format(format!(
                        "feature rect ({}, {}, {}, {}) exceeds the {}x{} window",
                        r.x, r.y, r.width, r.height, self.window_width, self.window_height
                    )));
                }
            }
        }
        for (si, stage) in self.stages.iter().enumerate() {
            for wc in &stage.classifiers {
                for (ni, node) in wc.nodes.iter().enumerate() {
                    if node.feature >= self.features.len() {
                        return Err(CascadeError::Format(format!(
                            "stage {si}: feature index {} out of range ({} features)",
                            node.feature,
                            self.features.len()
                        )));
                    }
                    for child in [node.left, node.right] {
                        let ok = if child <= 0 {
                            ((-child) as usize) < wc.leaves.len()
                        } else {
                            // Children must point forward so tree walks terminate.
                            (child as usize) > ni && (child as usize) < wc.nodes.len()
                        };
                        if !ok {
                            return Err(CascadeError::Format(format!(
                                "stage {si}: node {ni} has invalid child {child}"
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Scan every scale and return grouped face rectangles in frame coordinates.
    pub fn detect_multi_scale(&self, gray: &GrayImage) -> Vec<FaceRect> {
        let (img_w, img_h) = gray.dimensions();
        let (win_w0, win_h0) = self.window_size();
        let (min_w, min_h) = self.params.min_size.unwrap_or((win_w0, win_h0));
        let scale_factor = self.params.scale_factor as f64;

        let mut hits = Vec::new();
        let mut factor = 1.0f64;
        loop {
            let win_w = (win_w0 as f64 * factor).round() as u32;
            let win_h = (win_h0 as f64 * factor).round() as u32;
            let scaled_w = (img_w as f64 / factor).round() as u32;
            let scaled_h = (img_h as f64 / factor).round() as u32;

            if scaled_w < win_w0 || scaled_h < win_h0 || win_w > img_w || win_h > img_h {
                break;
            }

            if win_w >= min_w && win_h >= min_h {
                let scaled: Cow<'_, GrayImage> = if factor == 1.0 {
                    Cow::Borrowed(gray)
                } else {
                    Cow::Owned(imageops::resize(gray, scaled_w, scaled_h, FilterType::Triangle))
                };
                let ii = Integral::new(&scaled);
                let step = if factor > 2.0 { 1 } else { 2 };
                let before = hits.len();

                for y in (0..=(scaled_h - win_h0) as usize).step_by(step) {
                    for x in (0..=(scaled_w - win_w0) as usize).step_by(step) {
                        if self.classify_window(&ii, x, y) {
                            hits.push(FaceRect::new(
                                (x as f64 * factor).round() as u32,
                                (y as f64 * factor).round() as u32,
                                win_w,
                                win_h,
                            ));
                        }
                    }
                }
                tracing::trace!(factor, hits = hits.len() - before, "cascade scale scanned");
            }

            factor *= scale_factor;
        }

        group_rectangles(&hits, self.params.min_neighbors, GROUP_EPS)
    }

    /// Run all stages on the window whose top-left corner is (x, y).
    fn classify_window(&self, ii: &Integral, x: usize, y: usize) -> bool {
        // Variance normalisation over the window interior (1px border), as OpenCV does.
        // Windows with a standard deviation of 10 grey levels or less are rejected
        // outright; their ratio tests would only see sensor noise.
        let nw = self.window_width - 2;
        let nh = self.window_height - 2;
        let area = (nw * nh) as f64;
        let s = ii.sum(x + 1, y + 1, nw, nh) as f64;
        let sq = ii.sq_sum(x + 1, y + 1, nw, nh) as f64;
        let variance = area * sq - s * s;
        if variance <= 0.0 {
            return false;
        }
        let norm = variance.sqrt();
        if area / norm >= MIN_CONTRAST_RATIO {
            return false;
        }

        self.stages.iter().all(|stage| {
            let total: f64 = stage
                .classifiers
                .iter()
                .map(|wc| self.eval_weak(wc, ii, x, y, norm))
                .sum();
            total >= stage.threshold
        })
    }

    fn eval_weak(&self, wc: &WeakClassifier, ii: &Integral, x: usize, y: usize, norm: f64) -> f64 {
        let mut idx = 0usize;
        loop {
            let node = &wc.nodes[idx];
            let value = self.features[node.feature].value(ii, x, y);
            let next = if value < node.threshold * norm {
                node.left
            } else {
                node.right
            };
            if next <= 0 {
                return wc.leaves[(-next) as usize];
            }
            idx = next as usize;
        }
    }
}

impl FaceDetector for HaarCascade {
    fn detect(&mut self, gray: &GrayImage) -> Vec<FaceRect> {
        self.detect_multi_scale(gray)
    }
}

/// Summed-area tables for pixel values and squared pixel values.
struct Integral {
    stride: usize,
    sum: Vec<u64>,
    sq: Vec<u64>,
}

impl Integral {
    fn new(img: &GrayImage) -> Self {
        let (w, h) = (img.width() as usize, img.height() as usize);
        let stride = w + 1;
        let mut sum = vec![0u64; stride * (h + 1)];
        let mut sq = vec![0u64; stride * (h + 1)];
        let raw = img.as_raw();

        for y in 0..h {
            let mut row_sum = 0u64;
            let mut row_sq = 0u64;
            for x in 0..w {
                let p = raw[y * w + x] as u64;
                row_sum += p;
                row_sq += p * p;
                sum[(y + 1) * stride + x + 1] = sum[y * stride + x + 1] + row_sum;
                sq[(y + 1) * stride + x + 1] = sq[y * stride + x + 1] + row_sq;
            }
        }

        Self { stride, sum, sq }
    }

    fn sum(&self, x: usize, y: usize, w: usize, h: usize) -> u64 {
        Self::rect(&self.sum, self.stride, x, y, w, h)
    }

    fn sq_sum(&self, x: usize, y: usize, w: usize, h: usize) -> u64 {
        Self::rect(&self.sq, self.stride, x, y, w, h)
    }

    fn rect(table: &[u64], stride: usize, x: usize, y: usize, w: usize, h: usize) -> u64 {
        let tl = table[y * stride + x];
        let tr = table[y * stride + x + w];
        let bl = table[(y + h) * stride + x];
        let br = table[(y + h) * stride + x + w];
        (br + tl) - (tr + bl)
    }
}

/// Cluster similar rectangles and average each cluster.
///
/// Clusters with `min_neighbors` or fewer members are dropped, as are
/// clusters sitting inside a stronger cluster. With `min_neighbors == 0`
/// the input is returned unchanged.
pub fn group_rectangles(rects: &[FaceRect], min_neighbors: usize, eps: f64) -> Vec<FaceRect> {
    if min_neighbors == 0 || rects.is_empty() {
        return rects.to_vec();
    }

    let n = rects.len();
    let mut parent: Vec<usize> = (0..n).collect();
    for i in 0..n {
        for j in (i + 1)..n {
            if similar(&rects[i], &rects[j], eps) {
                let a = find_root(&mut parent, i);
                let b = find_root(&mut parent, j);
                if a != b {
                    parent[b] = a;
                }
            }
        }
    }

    // Cluster accumulators in order of first appearance: (x, y, w, h, count).
    let mut cluster_of_root = vec![usize::MAX; n];
    let mut acc: Vec<(f64, f64, f64, f64, usize)> = Vec::new();
    for (i, r) in rects.iter().enumerate() {
        let root = find_root(&mut parent, i);
        if cluster_of_root[root] == usize::MAX {
            cluster_of_root[root] = acc.len();
            acc.push((0.0, 0.0, 0.0, 0.0, 0));
        }
        let c = &mut acc[cluster_of_root[root]];
        c.0 += r.x as f64;
        c.1 += r.y as f64;
        c.2 += r.width as f64;
        c.3 += r.height as f64;
        c.4 += 1;
    }

    let averaged: Vec<(FaceRect, usize)> = acc
        .iter()
        .map(|&(x, y, w, h, count)| {
            let s = 1.0 / count as f64;
            (
                FaceRect::new(
                    (x * s).round() as u32,
                    (y * s).round() as u32,
                    (w * s).round() as u32,
                    (h * s).round() as u32,
                ),
                count,
            )
        })
        .collect();

    let mut grouped = Vec::new();
    for (i, &(r1, n1)) in averaged.iter().enumerate() {
        if n1 <= min_neighbors {
            continue;
        }
        let inside_stronger = averaged.iter().enumerate().any(|(j, &(r2, n2))| {
            if i == j || n2 <= min_neighbors {
                return false;
            }
            let dx = (r2.width as f64 * eps).round() as i64;
            let dy = (r2.height as f64 * eps).round() as i64;
            let (x1, y1, w1, h1) = (r1.x as i64, r1.y as i64, r1.width as i64, r1.height as i64);
            let (x2, y2, w2, h2) = (r2.x as i64, r2.y as i64, r2.width as i64, r2.height as i64);
            x1 >= x2 - dx
                && y1 >= y2 - dy
                && x1 + w1 <= x2 + w2 + dx
                && y1 + h1 <= y2 + h2 + dy
                && (n2 > n1.max(3) || n1 < 3)
        });
        if !inside_stronger {
            grouped.push(r1);
        }
    }
    grouped
}

fn similar(a: &FaceRect, b: &FaceRect, eps: f64) -> bool {
    let delta = eps * (a.width.min(b.width) + a.height.min(b.height)) as f64 * 0.5;
    let close = |p: u32, q: u32| (p as f64 - q as f64).abs() <= delta;
    close(a.x, b.x)
        && close(a.y, b.y)
        && close(a.x + a.width, b.x + b.width)
        && close(a.y + a.height, b.y + b.height)
}

fn find_root(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

// --- XML helpers ---

fn child<'a, 'input>(node: Node<'a, 'input>, tag: &str) -> Option<Node<'a, 'input>> {
    node.children().find(|n| n.has_tag_name(tag))
}

fn required_child<'a, 'input>(
    node: Node<'a, 'input>,
    tag: &str,
) -> Result<Node<'a, 'input>, CascadeError> {
    child(node, tag).ok_or_else(|| CascadeError::Format(format!("missing <{tag}> element")))
}

fn child_text<'a>(node: Node<'a, '_>, tag: &str) -> Result<&'a str, CascadeError> {
    Ok(required_child(node, tag)?.text().unwrap_or("").trim())
}

fn parse_scalar<T: std::str::FromStr>(node: Node<'_, '_>, tag: &str) -> Result<T, CascadeError> {
    let text = child_text(node, tag)?;
    text.parse()
        .map_err(|_| CascadeError::Format(format!("<{tag}> is not a number: {text:?}")))
}

fn parse_numbers(text: &str) -> Result<Vec<f64>, CascadeError> {
    text.split_whitespace()
        .map(|tok| {
            tok.parse::<f64>()
                .map_err(|_| CascadeError::Format(format!("not a number: {tok:?}")))
        })
        .collect()
}

fn parse_stage(node: Node<'_, '_>) -> Result<Stage, CascadeError> {
    let threshold: f64 = parse_scalar(node, "stageThreshold")?;
    let classifiers = required_child(node, "weakClassifiers")?
        .children()
        .filter(|n| n.is_element())
        .map(|wc| {
            let internal = parse_numbers(child_text(wc, "internalNodes")?)?;
            let leaves = parse_numbers(child_text(wc, "leafValues")?)?;
            if internal.is_empty() || internal.len() % 4 != 0 {
                return Err(CascadeError::Format(format!(
                    "internalNodes must hold groups of 4 values, got {}",
                    internal.len()
                )));
            }
            let nodes = internal
                .chunks_exact(4)
                .map(|c| TreeNode {
                    left: c[0] as i32,
                    right: c[1] as i32,
                    feature: c[2] as usize,
                    threshold: c[3],
                })
                .collect();
            Ok(WeakClassifier { nodes, leaves })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Stage {
        threshold,
        classifiers,
    })
}

fn parse_feature(node: Node<'_, '_>) -> Result<HaarFeature, CascadeError> {
    if let Some(tilted) = child(node, "tilted") {
        if tilted.text().unwrap_or("0").trim() != "0" {
            return Err(CascadeError::Unsupported("tilted Haar features".into()));
        }
    }
    let rects = required_child(node, "rects")?
        .children()
        .filter(|n| n.is_element())
        .map(|r| {
            let v = parse_numbers(r.text().unwrap_or(""))?;
            if v.len() != 5 || v[..4].iter().any(|&c| c < 0.0) {
                return Err(CascadeError::Format(format!(
                    "feature rect must be 'x y w h weight', got {v:?}"
                )));
            }
            Ok(WeightedRect {
                x: v[0] as usize,
                y: v[1] as usize,
                width: v[2] as usize,
                height: v[3] as usize,
                weight: v[4],
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    if rects.is_empty() {
        return Err(CascadeError::Format("feature without rects".into()));
    }
    Ok(HaarFeature { rects })
}
