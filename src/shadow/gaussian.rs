use crate::backend::{ComputeJobs, JobId, ParamValue};
use std::f32::consts::PI;

pub const KERNEL_RADIUS_PROPERTY: &str = "kernel_radius";
const WEIGHTS_PARAM_PREFIX: &str = "c_weights[";

/// The left half and center of a normalized gaussian kernel, `kernel_radius + 1` weights.
///
/// The kernel is mirrored around the last weight, so `2 * sum - center` is one.
pub fn gaussian_weights(kernel_radius: u8, deviation_factor: f32) -> Vec<f32> {
    assert!(kernel_radius % 2 == 0, "kernel_radius must be even!");

    let radius = usize::from(kernel_radius);
    let deviation = f32::from(kernel_radius) * deviation_factor;

    if deviation <= 0.0 {
        let mut weights = vec![0.0; radius + 1];
        weights[radius] = 1.0;
        return weights;
    }

    let fraction = 1.0 / (2.0 * PI * deviation * deviation).sqrt();
    let mut weights: Vec<f32> = (0..=radius)
        .map(|i| {
            let x = i as f32 - f32::from(kernel_radius) + 0.5;
            fraction * (-(x * x) / (2.0 * deviation * deviation)).exp()
        })
        .collect();

    let sum = 2.0 * weights.iter().sum::<f32>() - weights[radius];
    for weight in &mut weights {
        *weight /= sum;
    }

    weights
}

/// Replaces the blur weights of `job` and updates its kernel radius property.
pub(crate) fn upload_gaussian_weights(
    compute: &mut dyn ComputeJobs,
    job: JobId,
    kernel_radius: u8,
    weights: &[f32],
) {
    if compute.property(job, KERNEL_RADIUS_PROPERTY) != Some(i32::from(kernel_radius)) {
        compute.set_property(job, KERNEL_RADIUS_PROPERTY, i32::from(kernel_radius));
    }

    compute.remove_parameters_with_prefix(job, WEIGHTS_PARAM_PREFIX);

    for (i, chunk) in weights.chunks(4).enumerate() {
        compute.add_parameter(
            job,
            &format!("{WEIGHTS_PARAM_PREFIX}{i}]"),
            ParamValue::Floats(chunk.to_vec()),
        );
    }

    compute.set_params_dirty(job);
}
