use teatime_edge::bpu::{
    BuiltinFcosDecoder, OutputTensor, PostProcessSettings, TensorDescriptor, TensorLayout,
    TensorPostProcessor, FCOS_STRIDES,
};
use teatime_edge::frame::BoundingBox;

const MODEL: usize = 512;
const CLASSES: usize = 80;
const SCALE: f32 = 0.125;

/// Flat index of `(channel, y, x)` in a batch-1 tensor.
fn index(layout: TensorLayout, channels: usize, h: usize, w: usize, c: usize, y: usize, x: usize) -> usize {
    match layout {
        TensorLayout::Nhwc => (y * w + x) * channels + c,
        TensorLayout::Nchw => (c * h + y) * w + x,
    }
}

fn shape(layout: TensorLayout, channels: usize, side: usize) -> Vec<usize> {
    match layout {
        TensorLayout::Nhwc => vec![1, side, side, channels],
        TensorLayout::Nchw => vec![1, channels, side, side],
    }
}

/// Raw model outputs in real units. `cells` lists `(stride index, y, x, class,
/// class logit, box distance in stride units)`; every other cell is background.
struct Outputs {
    layout: TensorLayout,
    values: Vec<Vec<f32>>,
}

impl Outputs {
    fn new(layout: TensorLayout) -> Self {
        let mut values = Vec::new();
        for (channels, fill) in [(CLASSES, -10.0f32), (4, 0.0), (1, 10.0)] {
            for stride in FCOS_STRIDES {
                let side = MODEL.div_ceil(stride);
                values.push(vec![fill; side * side * channels]);
            }
        }
        Self { layout, values }
    }

    fn person(&mut self, stride_index: usize, y: usize, x: usize, class: usize, logit: f32, dist: f32) {
        let side = MODEL.div_ceil(FCOS_STRIDES[stride_index]);
        let cls = index(self.layout, CLASSES, side, side, class, y, x);
        self.values[stride_index][cls] = logit;
        for k in 0..4 {
            let b = index(self.layout, 4, side, side, k, y, x);
            self.values[stride_index + 5][b] = dist;
        }
    }

    fn descriptors(&self, quantized: bool) -> Vec<TensorDescriptor> {
        let mut out = Vec::new();
        for channels in [CLASSES, 4, 1] {
            for stride in FCOS_STRIDES {
                let s = shape(self.layout, channels, MODEL.div_ceil(stride));
                out.push(if quantized {
                    TensorDescriptor::quantized(s, self.layout, vec![SCALE])
                } else {
                    TensorDescriptor::float(s, self.layout)
                });
            }
        }
        out
    }

    fn tensors(&self, quantized: bool) -> Vec<OutputTensor> {
        self.values
            .iter()
            .map(|v| {
                if quantized {
                    OutputTensor::i32(v.iter().map(|x| (x / SCALE).round() as i32).collect())
                } else {
                    OutputTensor::f32(v.clone())
                }
            })
            .collect()
    }
}

fn processor(outputs: &Outputs, quantized: bool, pad_resize: bool) -> TensorPostProcessor {
    TensorPostProcessor::new(
        outputs.descriptors(quantized),
        Box::new(BuiltinFcosDecoder::new()),
        PostProcessSettings {
            pad_resize,
            ..PostProcessSettings::default()
        },
    )
    .expect("valid FCOS outputs")
}

#[test]
fn quantized_outputs_decode_to_frame_space_with_nms() {
    let mut outputs = Outputs::new(TensorLayout::Nhwc);
    // strongest person at stride 8, centre (164, 84), box (148, 68, 180, 100)
    outputs.person(0, 10, 20, 0, 10.0, 2.0);
    // weaker overlapping person at stride 16, box (152, 72, 184, 104), IoU 0.62
    outputs.person(1, 5, 10, 0, 2.0, 1.0);
    // a car elsewhere is dropped by the person filter
    outputs.person(2, 2, 2, 2, 10.0, 1.0);

    let mut post = processor(&outputs, true, false);
    let detections = post
        .process(&outputs.tensors(true), 1920, 1080)
        .expect("process");

    assert_eq!(detections.len(), 1);
    let d = &detections[0];
    assert!(d.is_person());
    assert!(d.confidence > 0.99);
    // x scaled by 1920/512, y by 1080/512, truncated
    assert_eq!(d.bbox, BoundingBox::new(555, 143, 675, 210));
}

#[test]
fn letterboxed_float_outputs_remove_padding() {
    let mut outputs = Outputs::new(TensorLayout::Nchw);
    // stride 16, centre (168, 200), box (152, 184, 184, 216) in model space
    outputs.person(1, 12, 10, 0, 8.0, 1.0);

    let mut post = processor(&outputs, false, true);
    // 1024x512 letterboxed into 512x512: scale 0.5, 128 rows of padding top and bottom
    let detections = post
        .process(&outputs.tensors(false), 1024, 512)
        .expect("process");
    assert_eq!(detections.len(), 1);
    assert_eq!(detections[0].bbox, BoundingBox::new(304, 112, 368, 176));
}

#[test]
fn each_frame_is_scaled_to_its_own_size() {
    let mut outputs = Outputs::new(TensorLayout::Nhwc);
    // model box (148, 68, 180, 100)
    outputs.person(0, 10, 20, 0, 10.0, 2.0);
    let tensors = outputs.tensors(false);
    let mut post = processor(&outputs, false, false);

    let full_hd = post.process(&tensors, 1920, 1080).expect("process 1080p");
    assert_eq!(full_hd[0].bbox, BoundingBox::new(555, 143, 675, 210));

    // same processor, smaller camera: x by 640/512, y by 480/512
    let vga = post.process(&tensors, 640, 480).expect("process 480p");
    assert_eq!(vga.len(), 1);
    assert_eq!(vga[0].bbox, BoundingBox::new(185, 63, 225, 93));

    let again = post.process(&tensors, 1920, 1080).expect("process 1080p again");
    assert_eq!(again[0].bbox, full_hd[0].bbox);
}

#[test]
fn empty_scene_yields_no_detections() {
    let outputs = Outputs::new(TensorLayout::Nhwc);
    let mut post = processor(&outputs, true, false);
    assert!(post
        .process(&outputs.tensors(true), 640, 480)
        .expect("process")
        .is_empty());
}

#[test]
fn mismatched_buffers_are_rejected() {
    let outputs = Outputs::new(TensorLayout::Nhwc);
    let mut post = processor(&outputs, true, false);
    // float buffers against quantized descriptors
    assert!(post.process(&outputs.tensors(false), 640, 480).is_err());
    assert!(post.process(&outputs.tensors(true)[..14], 640, 480).is_err());
}

#[test]
fn wrong_output_count_fails_construction() {
    let outputs = Outputs::new(TensorLayout::Nhwc);
    let mut descriptors = outputs.descriptors(false);
    descriptors.pop();
    assert!(TensorPostProcessor::new(
        descriptors,
        Box::new(BuiltinFcosDecoder::new()),
        PostProcessSettings::default()
    )
    .is_err());
}
