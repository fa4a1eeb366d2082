use std::env;

/// Debug toggles resolved once, at [`crate::Device`] construction time, from
/// the environment. Mirrors the three `LIBDRM_TEGRA_DEBUG_*` knobs the
/// original C library reads at `drm_tegra_new`/`drm_tegra_wrap` time.
#[derive(Clone, Copy, Debug, Default)]
pub struct Config {
    /// `LIBDRM_TEGRA_DEBUG_BO`: disables the reuse cache entirely, forcing
    /// every allocation through the kernel's `GEM_CREATE` ioctl.
    pub debug_bo: bool,

    /// `LIBDRM_TEGRA_DEBUG_BO_BACK_GUARD`: pads allocations with an extra
    /// guard page after the requested size, to catch buffer overruns.
    pub debug_bo_back_guard: bool,

    /// `LIBDRM_TEGRA_DEBUG_BO_FRONT_GUARD`: pads allocations with an extra
    /// guard page before the requested size, to catch buffer underruns.
    pub debug_bo_front_guard: bool,
}

impl Config {
    /// Reads the debug environment variables once. A variable enables its
    /// toggle only when set to exactly `"1"`.
    pub fn from_env() -> Self {
        Self {
            debug_bo: is_enabled("LIBDRM_TEGRA_DEBUG_BO"),
            debug_bo_back_guard: is_enabled("LIBDRM_TEGRA_DEBUG_BO_BACK_GUARD"),
            debug_bo_front_guard: is_enabled("LIBDRM_TEGRA_DEBUG_BO_FRONT_GUARD"),
        }
    }
}

fn is_enabled(var: &str) -> bool {
    env::var(var).map(|v| v == "1").unwrap_or(false)
}
