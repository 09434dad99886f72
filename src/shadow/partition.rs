//! Splits the shadow ray march into parallel Bresenham lines.
//!
//! # Explanation
//! The light is marched across the heightmap along its direction projected on the XZ
//! plane. The axis that direction advances fastest on is the major axis, the other one
//! the minor axis. Every compute thread walks one Bresenham line, stepping once per
//! iteration along the major axis and occasionally along the minor axis.
//!
//! Lines are parallel and one texel apart on the minor axis, so together they visit
//! every texel exactly once. The first series of thread groups starts its lines on the
//! edge the light enters from. Lines that enter the map through the neighbouring edge
//! instead are handled by a second series, which starts them directly on that edge with
//! the error term they would have accumulated up to there.
//!
//! All line math runs in integers with sub-texel precision, so the GPU's incremental
//! float arithmetic reproduces it exactly.

use crate::error::{TerraError, TerraResult};
use bevy::math::{IVec2, Vec2};
use bytemuck::{Pod, Zeroable};

/// Slots of the starts buffer. Each slot packs two thread starts.
pub const MAX_START_SLOTS: usize = 4096;
pub const MAX_THREAD_GROUPS: usize = 4096;
pub const STARTS_BUFFER_SIZE: usize = MAX_START_SLOTS * 16;
pub const PER_GROUP_BUFFER_SIZE: usize = MAX_THREAD_GROUPS * 16;

const SUBTEXEL_PRECISION: i64 = 256;

/// Per thread group data read by the shadow generator.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct PerGroupData {
    pub iterations: i32,
    /// Added to the half step error every line of the group starts with.
    pub delta_error_start: f32,
    pub padding: [f32; 2],
}

/// An integer Bresenham line along the major axis with the given slope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct BresenhamLine {
    dx: i64,
    dy: i64,
}

impl BresenhamLine {
    fn new(major_len: u32, slope: f32) -> Self {
        let dx = 2 * SUBTEXEL_PRECISION * i64::from(major_len.max(1));
        let dy = ((dx as f64) * f64::from(slope)).round() as i64;

        Self {
            dx,
            dy: dy.clamp(0, dx),
        }
    }

    /// How far the line has moved on the minor axis after `steps` major steps.
    fn minor_offset(&self, steps: u32) -> i64 {
        let overshoot = i64::from(steps) * self.dy - self.dx / 2;
        if overshoot <= 0 {
            0
        } else {
            (overshoot + self.dx - 1) / self.dx
        }
    }

    /// The error term after `steps` major steps, in `[0, dx)`.
    fn error_after(&self, steps: u32) -> i64 {
        self.dx / 2 - i64::from(steps) * self.dy + self.minor_offset(steps) * self.dx
    }

    /// The fewest major steps after which the line has moved `minor` texels.
    fn steps_to_reach(&self, minor: u32) -> u32 {
        if minor == 0 {
            0
        } else if self.dy == 0 {
            u32::MAX
        } else {
            let threshold = (2 * i64::from(minor) - 1) * self.dx / 2;
            (threshold / self.dy + 1).min(i64::from(u32::MAX)) as u32
        }
    }
}

/// The values of the shadow generator's tunable parameters that depend on the
/// light direction.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MarchParams {
    pub steep: bool,
    /// Sub-texel (major, minor) increments of the error term.
    pub delta: Vec2,
    /// Texel step per iteration on the (major, minor) axes.
    pub xy_step: [i32; 2],
}

/// One compute dispatch worth of Bresenham lines.
#[derive(Clone, Debug, PartialEq)]
pub struct ShadowPartition {
    pub params: MarchParams,
    /// Start of every thread, in (major, minor) texel coordinates, in dispatch order.
    pub starts: Vec<IVec2>,
    pub groups: Vec<PerGroupData>,
    pub threads_per_group: u32,
    major_len: u32,
    minor_len: u32,
}

impl ShadowPartition {
    /// Partitions a `width` x `height` shadow map lit from `light_dir` (XZ).
    pub fn compute(width: u32, height: u32, light_dir: Vec2, threads_per_group: u32) -> TerraResult<Self> {
        let threads_per_group = threads_per_group.max(1);
        let light_dir = match light_dir.normalize_or_zero() {
            dir if dir.length_squared() >= 1e-6 => dir,
            _ => Vec2::X,
        };

        let steep = light_dir.y.abs() > light_dir.x.abs();
        let (major, minor) = if steep {
            (light_dir.y, light_dir.x)
        } else {
            (light_dir.x, light_dir.y)
        };
        let (major_len, minor_len) = if steep { (height, width) } else { (width, height) };

        let step = IVec2::new(
            if major >= 0.0 { 1 } else { -1 },
            if minor >= 0.0 { 1 } else { -1 },
        );
        let origin = IVec2::new(
            if step.x > 0 { 0 } else { major_len as i32 - 1 },
            if step.y > 0 { 0 } else { minor_len as i32 - 1 },
        );

        let line = BresenhamLine::new(major_len, minor.abs() / major.abs());
        let tpg = threads_per_group;

        let mut starts = Vec::new();
        let mut groups = Vec::new();

        // Lines entering through the near edge of the major axis.
        for group in 0..minor_len.div_ceil(tpg) {
            let first_line = group * tpg;
            groups.push(PerGroupData {
                iterations: line.steps_to_reach(minor_len - first_line).min(major_len) as i32,
                delta_error_start: 0.0,
                padding: [0.0; 2],
            });
            starts.extend(
                (0..tpg).map(|lane| origin + IVec2::new(0, (first_line + lane) as i32 * step.y)),
            );
        }

        // Lines entering through the near edge of the minor axis.
        let last_offset = line.minor_offset(major_len - 1) as u32;
        for group in 0..last_offset.div_ceil(tpg) {
            let entry_step = line.steps_to_reach(group * tpg + 1);
            groups.push(PerGroupData {
                iterations: (major_len - entry_step) as i32,
                delta_error_start: (line.error_after(entry_step) - line.dx / 2) as f32,
                padding: [0.0; 2],
            });
            starts.extend((0..tpg).map(|lane| {
                origin + IVec2::new(entry_step as i32 * step.x, -(lane as i32) * step.y)
            }));
        }

        if groups.len() > MAX_THREAD_GROUPS || starts.len() > MAX_START_SLOTS * 2 {
            return Err(TerraError::HeightmapTooLarge {
                size: major_len.max(minor_len),
                max: (MAX_START_SLOTS * 2 / groups.len().max(1)) as u32,
            });
        }

        Ok(Self {
            params: MarchParams {
                steep,
                delta: Vec2::new(line.dx as f32, line.dy as f32),
                xy_step: step.to_array(),
            },
            starts,
            groups,
            threads_per_group,
            major_len,
            minor_len,
        })
    }

    pub fn thread_group_count(&self) -> u32 {
        self.groups.len() as u32
    }

    /// The starts buffer contents: thread `t` lands in `xy` of slot `t`, or in `zw` of
    /// slot `t - MAX_START_SLOTS` past the first half.
    pub fn starts_buffer(&self) -> Vec<[i32; 4]> {
        let mut slots = vec![[0; 4]; MAX_START_SLOTS.min(self.starts.len())];

        for (thread, start) in self.starts.iter().enumerate() {
            let (slot, half) = (thread % MAX_START_SLOTS, thread / MAX_START_SLOTS);
            slots[slot][half * 2] = start.x;
            slots[slot][half * 2 + 1] = start.y;
        }

        slots
    }

    /// Runs the dispatch on the CPU the way the shadow generator does, calling `visit`
    /// with the (x, z) texel of every step that lands on the map.
    pub fn march(&self, mut visit: impl FnMut(u32, u32)) {
        for thread in 0..self.starts.len() {
            self.march_thread(thread, &mut visit);
        }
    }

    fn march_thread(&self, thread: usize, visit: &mut impl FnMut(u32, u32)) {
        let MarchParams {
            steep,
            delta,
            xy_step,
        } = self.params;

        let group = &self.groups[thread / self.threads_per_group as usize];
        let mut pos = self.starts[thread];
        let mut error = delta.x * 0.5 + group.delta_error_start;

        for _ in 0..group.iterations {
            if pos.x >= 0
                && pos.y >= 0
                && (pos.x as u32) < self.major_len
                && (pos.y as u32) < self.minor_len
            {
                let (major, minor) = (pos.x as u32, pos.y as u32);
                if steep {
                    visit(minor, major);
                } else {
                    visit(major, minor);
                }
            }

            error -= delta.y;
            if error < 0.0 {
                pos.y += xy_step[1];
                error += delta.x;
            }
            pos.x += xy_step[0];
        }
    }
}
