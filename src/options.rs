use clap::Parser;

/// Sunny Jim - monitor and control solar batteries and inverters
#[derive(Debug, Parser)]
#[clap(author, version)]
pub struct Options {
    /// YAML configuration file
    #[clap(short = 'c', long = "config", default_value = "config.yaml")]
    pub config_file: String,

    /// Stop after this many seconds
    #[clap(short = 't', long = "time")]
    pub runtime: Option<u64>,
}

impl Options {
    pub fn new() -> Self {
        Self::parse()
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = Options::try_parse_from(["sunny-jim"]).unwrap();
        assert_eq!(options.config_file, "config.yaml");
        assert_eq!(options.runtime, None);
    }

    #[test]
    fn config_and_runtime_limit() {
        let options = Options::try_parse_from(["sunny-jim", "-c", "/etc/sunny-jim.yaml", "--time", "90"]).unwrap();
        assert_eq!(options.config_file, "/etc/sunny-jim.yaml");
        assert_eq!(options.runtime, Some(90));
    }
}
