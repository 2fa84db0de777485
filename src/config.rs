use std::path::PathBuf;

use clap::Parser;

/// Command-line options. There is deliberately no config file; everything
/// the server needs fits in a handful of flags.
#[derive(Parser, Debug)]
#[command(name = "tributary", about = "Self-hosted feed aggregator", version)]
pub struct Options {
    /// Path to the SQLite database. ":memory:" gives an ephemeral store.
    #[arg(long = "db", value_name = "PATH")]
    pub db: String,

    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 7049)]
    pub port: u16,

    /// Directory holding the built web UI. Omit to serve only the API.
    #[arg(long = "static", alias = "dist", value_name = "DIR")]
    pub static_dir: Option<PathBuf>,

    /// Mark items whose URL already exists on another feed as read on
    /// insert. Cannot tell a duplicate from a legitimate cross-post, which
    /// is why it is opt-in.
    #[arg(long)]
    pub dedupe: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_invocation() {
        let options = Options::try_parse_from(["tributary", "--db", "feeds.db"]).unwrap();
        assert_eq!(options.db, "feeds.db");
        assert_eq!(options.host, "127.0.0.1");
        assert_eq!(options.port, 7049);
        assert!(options.static_dir.is_none());
        assert!(!options.dedupe);
    }

    #[test]
    fn dist_is_an_alias_for_static() {
        let options =
            Options::try_parse_from(["tributary", "--db", "x", "--dist", "ui/"]).unwrap();
        assert_eq!(options.static_dir, Some(PathBuf::from("ui/")));
    }

    #[test]
    fn db_is_required() {
        assert!(Options::try_parse_from(["tributary"]).is_err());
    }
}
