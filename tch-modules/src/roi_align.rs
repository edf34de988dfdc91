use crate::common::*;

/// Bilinear region-of-interest pooling with a fixed sub-pixel sampling grid.
///
/// `input` is `[batch, channels, height, width]`, `boxes` are `[K, 4]` corner-form
/// boxes in input pixel coordinates before `spatial_scale` is applied, and
/// `batch_indices` is a `[K]` integer tensor selecting the source image of each box.
/// The output has shape `[K, channels, out_h, out_w]`.
///
/// With `aligned`, box coordinates are shifted by half a pixel so that sample
/// points land on pixel centers. Samples falling outside `[-1, size]` on either axis
/// contribute zero; the rest are clamped into the map before interpolation.
pub fn roi_align(
    input: &Tensor,
    boxes: &Tensor,
    batch_indices: &Tensor,
    output_size: (i64, i64),
    spatial_scale: f64,
    sampling_ratio: i64,
    aligned: bool,
) -> Result<Tensor> {
    let (_batch_size, channels, height, width) = input.size4()?;
    let (num_boxes, box_dim) = boxes.size2()?;
    ensure!(box_dim == 4, "expect boxes in shape [K, 4], but get {:?}", boxes.size());
    ensure!(
        batch_indices.size1()? == num_boxes,
        "boxes and batch indices have different lengths"
    );
    ensure!(sampling_ratio > 0, "sampling_ratio must be positive");
    let (out_h, out_w) = output_size;
    ensure!(out_h > 0 && out_w > 0, "output size must be positive");

    let device = input.device();
    let kind = input.kind();
    let options = (kind, device);
    let offset = if aligned { 0.5 } else { 0.0 };
    let sr = sampling_ratio;

    let boxes = boxes.to_kind(kind);
    let start_x = boxes.select(1, 0) * spatial_scale - offset;
    let start_y = boxes.select(1, 1) * spatial_scale - offset;
    let end_x = boxes.select(1, 2) * spatial_scale - offset;
    let end_y = boxes.select(1, 3) * spatial_scale - offset;

    // force malformed boxes to be at least 1x1 in the legacy mode
    let (roi_w, roi_h) = if aligned {
        (&end_x - &start_x, &end_y - &start_y)
    } else {
        (
            (&end_x - &start_x).clamp_min(1.0),
            (&end_y - &start_y).clamp_min(1.0),
        )
    };
    let bin_w = roi_w / out_w as f64;
    let bin_h = roi_h / out_h as f64;

    // sample coordinates in shape [K, out, sr]
    let sample_coords = |start: &Tensor, bin: &Tensor, out_len: i64| -> Tensor {
        let cells = Tensor::arange(out_len, options).view([1, out_len, 1]);
        let subs = (Tensor::arange(sr, options) + 0.5).view([1, 1, sr]) / sr as f64;
        let start = start.view([-1, 1, 1]);
        let bin = bin.view([-1, 1, 1]);
        start + &bin * cells + bin * subs
    };
    let ys = sample_coords(&start_y, &bin_h, out_h).view([num_boxes, out_h, sr, 1, 1]);
    let xs = sample_coords(&start_x, &bin_w, out_w).view([num_boxes, 1, 1, out_w, sr]);

    let valid_y = ys.ge(-1.0).logical_and(&ys.le(height as f64));
    let valid_x = xs.ge(-1.0).logical_and(&xs.le(width as f64));
    let valid = valid_y.logical_and(&valid_x).to_kind(kind);

    let ys = ys.clamp(0.0, (height - 1) as f64);
    let xs = xs.clamp(0.0, (width - 1) as f64);
    let y_low = ys.floor();
    let x_low = xs.floor();
    let y_high = (&y_low + 1.0).clamp_max((height - 1) as f64);
    let x_high = (&x_low + 1.0).clamp_max((width - 1) as f64);
    let ly = &ys - &y_low;
    let lx = &xs - &x_low;
    let hy = 1.0 - &ly;
    let hx = 1.0 - &lx;

    // flat row index into the [batch * height * width, channels] table
    let flat = input.permute([0, 2, 3, 1]).reshape([-1, channels]);
    let base = (batch_indices.to_kind(Kind::Int64) * (height * width)).view([-1, 1, 1, 1, 1]);
    let y_low = y_low.to_kind(Kind::Int64) * width;
    let y_high = y_high.to_kind(Kind::Int64) * width;
    let x_low = x_low.to_kind(Kind::Int64);
    let x_high = x_high.to_kind(Kind::Int64);

    let gather = |y_part: &Tensor, x_part: &Tensor| -> Tensor {
        let index = &base + y_part + x_part;
        let shape = index.size();
        flat.index_select(0, &index.reshape([-1]))
            .view([shape[0], shape[1], shape[2], shape[3], shape[4], channels])
    };

    let weighted = gather(&y_low, &x_low) * (&hy * &hx).unsqueeze(-1)
        + gather(&y_low, &x_high) * (&hy * &lx).unsqueeze(-1)
        + gather(&y_high, &x_low) * (&ly * &hx).unsqueeze(-1)
        + gather(&y_high, &x_high) * (&ly * &lx).unsqueeze(-1);
    let weighted = weighted * valid.unsqueeze(-1);

    // [K, out_h, sr, out_w, sr, C] -> [K, C, out_h, out_w]
    let output = weighted
        .mean_dim(&[2i64, 4][..], false, kind)
        .permute([0, 3, 1, 2])
        .contiguous();
    Ok(output)
}
