// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

/// Maximum number of frames per audio period.
pub const MAX_FRAME_SIZE: usize = 2048;

/// Maximum number of channels a single mixing task produces.
pub const MAX_OUTPUT_CHANNELS: usize = 2;

/// Number of recent samples tracked for release alignment.
pub const BLOCK_HISTORY: usize = 2;

/// Max length for short loops.
pub const SHORT_LOOP_LENGTH: usize = 256;

/// Minimum remaining loop length after a crossfade.
pub const REMAINING_AFTER_CROSSFADE: usize = 256;

/// Scale-factor sentinel meaning "no contribution" (decodes to exactly 0).
pub const MUTE_VOLUME: f32 = -121.0;

/// Windchest volumes at or below this level are treated as silent. The
/// original compared against literal zero; an epsilon avoids spawning
/// releases for denormal-quiet chests.
pub const MIN_WINDCHEST_LEVEL: f32 = 1e-6;

/// Age in samples after which a releasing sampler becomes a candidate for
/// polyphony eviction while the pool is above the soft limit.
pub const RELEASE_DROP_AGE_SAMPLES: u64 = 172 * 16;

/// Length of the eviction fade applied to dropped release samplers.
pub const RELEASE_DROP_FADE_MS: u32 = 370;
