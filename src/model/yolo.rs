//! YOLOv8 detector built on candle.
//!
//! Tensor names follow the `lmz/candle-yolo-v8` safetensors exports
//! (`net.*`, `fpn.*`, `head.*`), so pretrained and custom weights exported
//! the same way load through the same code.

use super::handle::Detection;
use crate::error::Error;
use candle_core::{DType, Device, IndexOp, Module, Result, Tensor, D};
use candle_nn::{batch_norm, conv2d, conv2d_no_bias, Conv2d, Conv2dConfig, VarBuilder};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    N,
    S,
    M,
    L,
    X,
}

impl Variant {
    pub fn suffix(&self) -> &'static str {
        match self {
            Variant::N => "n",
            Variant::S => "s",
            Variant::M => "m",
            Variant::L => "l",
            Variant::X => "x",
        }
    }

    pub fn multiples(&self) -> Multiples {
        let (depth, width, ratio) = match self {
            Variant::N => (0.33, 0.25, 2.0),
            Variant::S => (0.33, 0.50, 2.0),
            Variant::M => (0.67, 0.75, 1.5),
            Variant::L => (1.00, 1.00, 1.0),
            Variant::X => (1.00, 1.25, 1.0),
        };
        Multiples { depth, width, ratio }
    }
}

impl FromStr for Variant {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "n" => Ok(Variant::N),
            "s" => Ok(Variant::S),
            "m" => Ok(Variant::M),
            "l" => Ok(Variant::L),
            "x" => Ok(Variant::X),
            other => Err(Error::ConfigError(format!("Unknown detector variant: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Multiples {
    depth: f64,
    width: f64,
    ratio: f64,
}

impl Multiples {
    fn filters(&self) -> (usize, usize, usize) {
        let f1 = (256. * self.width) as usize;
        let f2 = (512. * self.width) as usize;
        let f3 = (512. * self.width * self.ratio) as usize;
        (f1, f2, f3)
    }
}

#[derive(Debug)]
struct Upsample {
    scale_factor: usize,
}

impl Module for Upsample {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (_b, _c, h, w) = xs.dims4()?;
        xs.upsample_nearest2d(self.scale_factor * h, self.scale_factor * w)
    }
}

/// Conv + batch-norm (folded into the conv weights) + SiLU.
#[derive(Debug)]
struct ConvBlock {
    conv: Conv2d,
}

impl ConvBlock {
    fn load(
        vb: VarBuilder,
        c1: usize,
        c2: usize,
        k: usize,
        stride: usize,
        padding: Option<usize>,
    ) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: padding.unwrap_or(k / 2),
            stride,
            groups: 1,
            dilation: 1,
            ..Default::default()
        };
        let bn = batch_norm(c2, 1e-3, vb.pp("bn"))?;
        let conv = conv2d_no_bias(c1, c2, k, cfg, vb.pp("conv"))?.absorb_bn(&bn)?;
        Ok(Self { conv })
    }
}

impl Module for ConvBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        candle_nn::ops::silu(&self.conv.forward(xs)?)
    }
}

#[derive(Debug)]
struct Bottleneck {
    cv1: ConvBlock,
    cv2: ConvBlock,
    residual: bool,
}

impl Bottleneck {
    fn load(vb: VarBuilder, c1: usize, c2: usize, shortcut: bool) -> Result<Self> {
        let cv1 = ConvBlock::load(vb.pp("cv1"), c1, c2, 3, 1, None)?;
        let cv2 = ConvBlock::load(vb.pp("cv2"), c2, c2, 3, 1, None)?;
        Ok(Self {
            cv1,
            cv2,
            residual: c1 == c2 && shortcut,
        })
    }
}

impl Module for Bottleneck {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let ys = self.cv2.forward(&self.cv1.forward(xs)?)?;
        if self.residual {
            xs + ys
        } else {
            Ok(ys)
        }
    }
}

#[derive(Debug)]
struct C2f {
    cv1: ConvBlock,
    cv2: ConvBlock,
    bottleneck: Vec<Bottleneck>,
}

impl C2f {
    fn load(vb: VarBuilder, c1: usize, c2: usize, n: usize, shortcut: bool) -> Result<Self> {
        let c = (c2 as f64 * 0.5) as usize;
        let cv1 = ConvBlock::load(vb.pp("cv1"), c1, 2 * c, 1, 1, None)?;
        let cv2 = ConvBlock::load(vb.pp("cv2"), (2 + n) * c, c2, 1, 1, None)?;
        let bottleneck = (0..n)
            .map(|idx| Bottleneck::load(vb.pp(format!("bottleneck.{idx}")), c, c, shortcut))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { cv1, cv2, bottleneck })
    }
}

impl Module for C2f {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut ys = self.cv1.forward(xs)?.chunk(2, 1)?;
        for m in self.bottleneck.iter() {
            let last = ys[ys.len() - 1].clone();
            ys.push(m.forward(&last)?);
        }
        self.cv2.forward(&Tensor::cat(ys.as_slice(), 1)?)
    }
}

#[derive(Debug)]
struct Sppf {
    cv1: ConvBlock,
    cv2: ConvBlock,
    k: usize,
}

impl Sppf {
    fn load(vb: VarBuilder, c1: usize, c2: usize, k: usize) -> Result<Self> {
        let c_ = c1 / 2;
        let cv1 = ConvBlock::load(vb.pp("cv1"), c1, c_, 1, 1, None)?;
        let cv2 = ConvBlock::load(vb.pp("cv2"), c_ * 4, c2, 1, 1, None)?;
        Ok(Self { cv1, cv2, k })
    }

    fn pool(&self, xs: &Tensor) -> Result<Tensor> {
        let pad = self.k / 2;
        xs.pad_with_zeros(2, pad, pad)?
            .pad_with_zeros(3, pad, pad)?
            .max_pool2d_with_stride(self.k, 1)
    }
}

impl Module for Sppf {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = self.cv1.forward(xs)?;
        let xs2 = self.pool(&xs)?;
        let xs3 = self.pool(&xs2)?;
        let xs4 = self.pool(&xs3)?;
        self.cv2.forward(&Tensor::cat(&[&xs, &xs2, &xs3, &xs4], 1)?)
    }
}

/// Distribution focal loss decoding of box offsets.
#[derive(Debug)]
struct Dfl {
    conv: Conv2d,
    bins: usize,
}

impl Dfl {
    fn load(vb: VarBuilder, bins: usize) -> Result<Self> {
        let conv = conv2d_no_bias(bins, 1, 1, Default::default(), vb.pp("conv"))?;
        Ok(Self { conv, bins })
    }
}

impl Module for Dfl {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b_sz, _channels, anchors) = xs.dims3()?;
        let xs = xs.reshape((b_sz, 4, self.bins, anchors))?.transpose(2, 1)?;
        let xs = candle_nn::ops::softmax(&xs, 1)?;
        self.conv.forward(&xs)?.reshape((b_sz, 4, anchors))
    }
}

#[derive(Debug)]
struct DarkNet {
    b1_0: ConvBlock,
    b1_1: ConvBlock,
    b2_0: C2f,
    b2_1: ConvBlock,
    b2_2: C2f,
    b3_0: ConvBlock,
    b3_1: C2f,
    b4_0: ConvBlock,
    b4_1: C2f,
    b5: Sppf,
}

impl DarkNet {
    fn load(vb: VarBuilder, m: Multiples) -> Result<Self> {
        let (w, r, d) = (m.width, m.ratio, m.depth);
        let c = |base: f64| (base * w) as usize;
        let n = |base: f64| (base * d).round() as usize;
        let top = (512. * w * r) as usize;

        Ok(Self {
            b1_0: ConvBlock::load(vb.pp("b1.0"), 3, c(64.), 3, 2, Some(1))?,
            b1_1: ConvBlock::load(vb.pp("b1.1"), c(64.), c(128.), 3, 2, Some(1))?,
            b2_0: C2f::load(vb.pp("b2.0"), c(128.), c(128.), n(3.), true)?,
            b2_1: ConvBlock::load(vb.pp("b2.1"), c(128.), c(256.), 3, 2, Some(1))?,
            b2_2: C2f::load(vb.pp("b2.2"), c(256.), c(256.), n(6.), true)?,
            b3_0: ConvBlock::load(vb.pp("b3.0"), c(256.), c(512.), 3, 2, Some(1))?,
            b3_1: C2f::load(vb.pp("b3.1"), c(512.), c(512.), n(6.), true)?,
            b4_0: ConvBlock::load(vb.pp("b4.0"), c(512.), top, 3, 2, Some(1))?,
            b4_1: C2f::load(vb.pp("b4.1"), top, top, n(3.), true)?,
            b5: Sppf::load(vb.pp("b5.0"), top, top, 5)?,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let x1 = self.b1_1.forward(&self.b1_0.forward(xs)?)?;
        let x2 = self
            .b2_2
            .forward(&self.b2_1.forward(&self.b2_0.forward(&x1)?)?)?;
        let x3 = self.b3_1.forward(&self.b3_0.forward(&x2)?)?;
        let x4 = self.b4_1.forward(&self.b4_0.forward(&x3)?)?;
        let x5 = self.b5.forward(&x4)?;
        Ok((x2, x3, x5))
    }
}

#[derive(Debug)]
struct Neck {
    up: Upsample,
    n1: C2f,
    n2: C2f,
    n3: ConvBlock,
    n4: C2f,
    n5: ConvBlock,
    n6: C2f,
}

impl Neck {
    fn load(vb: VarBuilder, m: Multiples) -> Result<Self> {
        let (w, r) = (m.width, m.ratio);
        let n = (3. * m.depth).round() as usize;
        let c = |base: f64| (base * w) as usize;

        Ok(Self {
            up: Upsample { scale_factor: 2 },
            n1: C2f::load(vb.pp("n1"), (512. * w * (1. + r)) as usize, c(512.), n, false)?,
            n2: C2f::load(vb.pp("n2"), c(768.), c(256.), n, false)?,
            n3: ConvBlock::load(vb.pp("n3"), c(256.), c(256.), 3, 2, Some(1))?,
            n4: C2f::load(vb.pp("n4"), c(768.), c(512.), n, false)?,
            n5: ConvBlock::load(vb.pp("n5"), c(512.), c(512.), 3, 2, Some(1))?,
            n6: C2f::load(
                vb.pp("n6"),
                (512. * w * (1. + r)) as usize,
                (512. * w * r) as usize,
                n,
                false,
            )?,
        })
    }

    fn forward(&self, p3: &Tensor, p4: &Tensor, p5: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let x = self
            .n1
            .forward(&Tensor::cat(&[&self.up.forward(p5)?, p4], 1)?)?;
        let head_1 = self
            .n2
            .forward(&Tensor::cat(&[&self.up.forward(&x)?, p3], 1)?)?;
        let head_2 = self
            .n4
            .forward(&Tensor::cat(&[&self.n3.forward(&head_1)?, &x], 1)?)?;
        let head_3 = self
            .n6
            .forward(&Tensor::cat(&[&self.n5.forward(&head_2)?, p5], 1)?)?;
        Ok((head_1, head_2, head_3))
    }
}

const STRIDES: [usize; 3] = [8, 16, 32];
const DFL_BINS: usize = 16;

fn make_anchors(levels: [&Tensor; 3], grid_cell_offset: f64) -> Result<(Tensor, Tensor)> {
    let dev = levels[0].device();
    let mut anchor_points = Vec::with_capacity(3);
    let mut stride_tensor = Vec::with_capacity(3);
    for (xs, stride) in levels.into_iter().zip(STRIDES) {
        let (_, _, h, w) = xs.dims4()?;
        let sx = (Tensor::arange(0, w as u32, dev)?.to_dtype(DType::F32)? + grid_cell_offset)?;
        let sy = (Tensor::arange(0, h as u32, dev)?.to_dtype(DType::F32)? + grid_cell_offset)?;
        let sx = sx.reshape((1, w))?.repeat((h, 1))?.flatten_all()?;
        let sy = sy.reshape((h, 1))?.repeat((1, w))?.flatten_all()?;
        anchor_points.push(Tensor::stack(&[&sx, &sy], D::Minus1)?);
        stride_tensor.push((Tensor::ones(h * w, DType::F32, dev)? * stride as f64)?);
    }
    let anchor_points = Tensor::cat(anchor_points.as_slice(), 0)?;
    let stride_tensor = Tensor::cat(stride_tensor.as_slice(), 0)?.unsqueeze(1)?;
    Ok((anchor_points, stride_tensor))
}

fn dist2bbox(distance: &Tensor, anchor_points: &Tensor) -> Result<Tensor> {
    let chunks = distance.chunk(2, 1)?;
    let x1y1 = anchor_points.broadcast_sub(&chunks[0])?;
    let x2y2 = anchor_points.broadcast_add(&chunks[1])?;
    let c_xy = ((&x1y1 + &x2y2)? * 0.5)?;
    let wh = (&x2y2 - &x1y1)?;
    Tensor::cat(&[c_xy, wh], 1)
}

type HeadBranch = (ConvBlock, ConvBlock, Conv2d);

#[derive(Debug)]
struct DetectionHead {
    dfl: Dfl,
    cv2: Vec<HeadBranch>,
    cv3: Vec<HeadBranch>,
    no: usize,
}

impl DetectionHead {
    fn load(vb: VarBuilder, nc: usize, filters: (usize, usize, usize)) -> Result<Self> {
        let dfl = Dfl::load(vb.pp("dfl"), DFL_BINS)?;
        let c1 = usize::max(filters.0, nc.min(100));
        let c2 = usize::max(filters.0 / 4, DFL_BINS * 4);
        let widths = [filters.0, filters.1, filters.2];

        let mut cv2 = Vec::with_capacity(3);
        let mut cv3 = Vec::with_capacity(3);
        for (i, &filter) in widths.iter().enumerate() {
            cv3.push(Self::branch(vb.pp(format!("cv3.{i}")), filter, c1, nc)?);
            cv2.push(Self::branch(vb.pp(format!("cv2.{i}")), filter, c2, 4 * DFL_BINS)?);
        }

        Ok(Self {
            dfl,
            cv2,
            cv3,
            no: nc + DFL_BINS * 4,
        })
    }

    fn branch(vb: VarBuilder, filter: usize, hidden: usize, out: usize) -> Result<HeadBranch> {
        let block0 = ConvBlock::load(vb.pp("0"), filter, hidden, 3, 1, None)?;
        let block1 = ConvBlock::load(vb.pp("1"), hidden, hidden, 3, 1, None)?;
        let conv = conv2d(hidden, out, 1, Default::default(), vb.pp("2"))?;
        Ok((block0, block1, conv))
    }

    fn forward_level(&self, xs: &Tensor, i: usize) -> Result<Tensor> {
        let run = |(b0, b1, conv): &HeadBranch| conv.forward(&b1.forward(&b0.forward(xs)?)?);
        let boxes = run(&self.cv2[i])?;
        let classes = run(&self.cv3[i])?;
        Tensor::cat(&[&boxes, &classes], 1)
    }

    fn forward(&self, xs0: &Tensor, xs1: &Tensor, xs2: &Tensor) -> Result<Tensor> {
        let xs0 = self.forward_level(xs0, 0)?;
        let xs1 = self.forward_level(xs1, 1)?;
        let xs2 = self.forward_level(xs2, 2)?;

        let (anchors, strides) = make_anchors([&xs0, &xs1, &xs2], 0.5)?;
        let anchors = anchors.transpose(0, 1)?.unsqueeze(0)?;
        let strides = strides.transpose(0, 1)?;

        let flatten = |xs: &Tensor| -> Result<Tensor> {
            let b = xs.dim(0)?;
            let el = xs.elem_count();
            xs.reshape((b, self.no, el / (b * self.no)))
        };
        let x_cat = Tensor::cat(&[flatten(&xs0)?, flatten(&xs1)?, flatten(&xs2)?], 2)?;
        let box_ = x_cat.i((.., ..DFL_BINS * 4))?;
        let cls = x_cat.i((.., DFL_BINS * 4..))?;

        let dbox = dist2bbox(&self.dfl.forward(&box_)?, &anchors)?.broadcast_mul(&strides)?;
        Tensor::cat(&[dbox, candle_nn::ops::sigmoid(&cls)?], 1)
    }
}

#[derive(Debug)]
pub struct YoloV8 {
    net: DarkNet,
    fpn: Neck,
    head: DetectionHead,
}

impl YoloV8 {
    pub fn load(vb: VarBuilder, variant: Variant, num_classes: usize) -> Result<Self> {
        let m = variant.multiples();
        let net = DarkNet::load(vb.pp("net"), m)?;
        let fpn = Neck::load(vb.pp("fpn"), m)?;
        let head = DetectionHead::load(vb.pp("head"), num_classes, m.filters())?;
        Ok(Self { net, fpn, head })
    }
}

impl Module for YoloV8 {
    /// Returns `(batch, 4 + classes, anchors)`: centre-x, centre-y, width,
    /// height in input pixels, then per-class scores.
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (p3, p4, p5) = self.net.forward(xs)?;
        let (h1, h2, h3) = self.fpn.forward(&p3, &p4, &p5)?;
        self.head.forward(&h1, &h2, &h3)
    }
}

/// Decodes one image's `(4 + classes, anchors)` prediction into detections.
pub fn detections(pred: &Tensor, labels: &[String], confidence: f32, iou: f32) -> Result<Vec<Detection>> {
    let pred = pred.to_device(&Device::Cpu)?.to_dtype(DType::F32)?;
    let (rows, _anchors) = pred.dims2()?;
    if rows <= 4 {
        return Ok(Vec::new());
    }
    let nclasses = rows - 4;

    let mut by_class: Vec<Vec<Detection>> = vec![Vec::new(); nclasses];
    for row in pred.t()?.contiguous()?.to_vec2::<f32>()? {
        let (class_id, score) = row[4..]
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::MIN), |best, (i, s)| if s > best.1 { (i, s) } else { best });
        if score <= confidence {
            continue;
        }

        let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
        by_class[class_id].push(Detection {
            xmin: cx - w / 2.,
            ymin: cy - h / 2.,
            xmax: cx + w / 2.,
            ymax: cy + h / 2.,
            class_id,
            class_name: labels
                .get(class_id)
                .cloned()
                .unwrap_or_else(|| format!("class_{class_id}")),
            confidence: score,
        });
    }

    let mut kept: Vec<Detection> = by_class
        .into_iter()
        .flat_map(|candidates| non_maximum_suppression(candidates, iou))
        .collect();
    kept.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    Ok(kept)
}

fn non_maximum_suppression(mut candidates: Vec<Detection>, threshold: f32) -> Vec<Detection> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if kept.iter().all(|k| iou(k, &candidate) <= threshold) {
            kept.push(candidate);
        }
    }
    kept
}

fn iou(a: &Detection, b: &Detection) -> f32 {
    let inter_w = (a.xmax.min(b.xmax) - a.xmin.max(b.xmin)).max(0.);
    let inter_h = (a.ymax.min(b.ymax) - a.ymin.max(b.ymin)).max(0.);
    let inter = inter_w * inter_h;
    let area = |d: &Detection| (d.xmax - d.xmin).max(0.) * (d.ymax - d.ymin).max(0.);
    let union = area(a) + area(b) - inter;
    if union <= 0. {
        0.
    } else {
        inter / union
    }
}
