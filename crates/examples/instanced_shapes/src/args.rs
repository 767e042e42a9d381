use std::{path::PathBuf, time::Duration};

use clap::Parser;

/// Keeps the sphere within 16-bit indices: 256 * 255 + 2 vertices.
const MAX_SPHERE_DIVISIONS: i64 = 256;

/// Ray traces two boxes and a sphere and writes the last frame to a PNG
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    #[clap(long, value_parser, default_value_t = 1280)]
    pub width: u32,

    #[clap(long, value_parser, default_value_t = 720)]
    pub height: u32,

    /// Number of frames to render, the camera orbits 1 degree per frame
    #[clap(short, long, value_parser, default_value_t = 1)]
    pub frames: u32,

    /// Where the last frame is written
    #[clap(short, long, value_parser, default_value = "instanced_shapes.png")]
    pub output: PathBuf,

    /// Directory holding the compiled SPIR-V shaders
    #[clap(long, value_parser, default_value = "./spv")]
    pub shader_dir: PathBuf,

    /// Bound on every fence wait, 0 waits forever
    #[clap(long, value_parser, default_value_t = 5000)]
    pub fence_timeout_ms: u64,

    /// Sphere divisions around the Y axis
    #[clap(long, value_parser = clap::value_parser!(u16).range(4..=MAX_SPHERE_DIVISIONS), default_value_t = 16)]
    pub sphere_longitude: u16,

    /// Sphere divisions from pole to pole
    #[clap(long, value_parser = clap::value_parser!(u16).range(2..=MAX_SPHERE_DIVISIONS), default_value_t = 16)]
    pub sphere_latitude: u16,

    /// Enable the Khronos validation layer
    #[clap(long, value_parser)]
    pub validation: bool,
}

impl Args {
    pub fn fence_timeout(&self) -> Option<Duration> {
        (self.fence_timeout_ms > 0).then(|| Duration::from_millis(self.fence_timeout_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_renderer_defaults() {
        let args = Args::try_parse_from(["instanced-shapes"]).unwrap();
        assert_eq!((args.width, args.height), (1280, 720));
        assert_eq!(args.frames, 1);
        assert_eq!(args.fence_timeout(), Some(Duration::from_secs(5)));
        assert_eq!((args.sphere_longitude, args.sphere_latitude), (16, 16));
        assert!(!args.validation);
    }

    #[test]
    fn sphere_divisions_are_range_checked() {
        let args = Args::try_parse_from(["instanced-shapes", "--sphere-longitude", "256", "--sphere-latitude", "256"]);
        assert!(args.is_ok());

        for (flag, value) in [("--sphere-longitude", "300"), ("--sphere-latitude", "257"), ("--sphere-longitude", "3")] {
            assert!(Args::try_parse_from(["instanced-shapes", flag, value]).is_err(), "{flag} {value}");
        }
    }

    #[test]
    fn zero_timeout_waits_forever() {
        let args = Args::try_parse_from(["instanced-shapes", "--fence-timeout-ms", "0", "-f", "90"]).unwrap();
        assert_eq!(args.fence_timeout(), None);
        assert_eq!(args.frames, 90);
    }
}
