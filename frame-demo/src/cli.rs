use std::path::PathBuf;

use bpaf::{batteries::verbose_by_slice, construct, long, OptionParser, Parser};
use tracing::level_filters::LevelFilter;

#[derive(Debug, Clone)]
pub struct Options {
    pub verbosity_level: LevelFilter,
    pub config_path: Option<PathBuf>,
    pub frames: u64,
}

pub fn options() -> OptionParser<Options> {
    let verbosity_level = verbose_by_slice(
        3,
        [
            LevelFilter::OFF,
            LevelFilter::ERROR,
            LevelFilter::WARN,
            LevelFilter::INFO,
            LevelFilter::DEBUG,
            LevelFilter::TRACE,
        ],
    );

    let config_path = long("config")
        .help("Reads the allocator and frame loop sizes from a JSON file")
        .argument("FILE")
        .complete_shell(bpaf::ShellComp::File {
            mask: Some("*.json"),
        })
        .optional();

    let frames = long("frames")
        .help("How many frames to simulate")
        .argument("N")
        .fallback(120)
        .display_fallback();

    construct!(Options {
        verbosity_level,
        config_path,
        frames,
    })
    .to_options()
    .descr("Runs a simulated game loop on top of the engine's allocators")
}

#[cfg(test)]
mod tests {
    use super::options;

    #[test]
    fn check_bpaf_invariants() {
        options().check_invariants(true);
    }

    #[test]
    fn frames_default_to_120() {
        let parsed = options().run_inner(&[] as &[&str]).unwrap();
        assert_eq!(120, parsed.frames);
        assert!(parsed.config_path.is_none());
    }

    #[test]
    fn parses_config_and_frames() {
        let parsed = options()
            .run_inner(&["--config", "demo.json", "--frames", "5"])
            .unwrap();
        assert_eq!(5, parsed.frames);
        assert_eq!(Some(std::path::PathBuf::from("demo.json")), parsed.config_path);
    }
}
