pub mod daemon;
pub mod jobs;

use clap::{Parser, Subcommand};

/// Translateable - manga translation job pipeline
#[derive(Parser, Debug)]
#[command(
    name = "translateable",
    version,
    about = "Translateable - manga translation job pipeline"
)]
pub struct Cli {
    /// Daemon host
    #[arg(long, default_value = "127.0.0.1", global = true)]
    pub host: String,

    /// Daemon port
    #[arg(long, default_value_t = 8388, global = true)]
    pub port: u16,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the daemon in the foreground
    Serve {
        /// Path to configuration file
        #[arg(short = 'c', long = "config")]
        config: Option<String>,

        /// Port to listen on (overrides config)
        #[arg(short = 'p', long = "listen-port")]
        listen_port: Option<u16>,

        /// Address to bind (overrides config)
        #[arg(long)]
        bind: Option<String>,

        /// Data directory path
        #[arg(long = "data-dir")]
        data_dir: Option<String>,
    },

    /// Submit images, an archive, a PDF or a URL for translation
    Submit {
        /// Image, ZIP/CBZ or PDF files; pages are ordered by file name
        #[arg(conflicts_with = "url", required_unless_present = "url")]
        files: Vec<String>,

        /// Fetch the source from a URL instead
        #[arg(long)]
        url: Option<String>,

        /// Target language code
        #[arg(short = 't', long = "to", default_value = "en")]
        target_language: String,

        /// Source language code (default: auto-detect)
        #[arg(short = 's', long = "from")]
        source_language: Option<String>,

        /// Display title
        #[arg(long)]
        title: Option<String>,

        /// Stop at the first failed page
        #[arg(long)]
        fail_fast: bool,

        /// Wait for the job to finish, printing progress
        #[arg(short = 'w', long)]
        wait: bool,
    },

    /// List translation jobs
    List {
        /// Only jobs with this status (queued, acquiring, processing, completed, failed)
        #[arg(long)]
        status: Option<String>,

        /// Case-insensitive title search
        #[arg(short = 'q', long)]
        query: Option<String>,

        /// Page of results, starting at 1
        #[arg(long, default_value_t = 1)]
        page: usize,

        /// Results per page
        #[arg(long, default_value_t = 20)]
        per_page: usize,

        /// Oldest first
        #[arg(long)]
        oldest: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show a job and its pages
    Status {
        /// Job id
        job: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Cancel a running job
    Cancel {
        /// Job id
        job: String,
    },

    /// Delete a job and everything it stored
    Delete {
        /// Job id
        job: String,

        /// Skip confirmation prompt
        #[arg(long)]
        yes: bool,
    },

    /// Download the translated pages as a ZIP, or a single page
    Download {
        /// Job id
        job: String,

        /// Output file (default: derived from the server's file name)
        #[arg(short = 'o', long)]
        output: Option<String>,

        /// Download only this page (zero-based)
        #[arg(long)]
        page: Option<usize>,
    },

    /// Show daemon health
    Health,
}

/// Build the base URL for the daemon HTTP API.
pub fn base_url(host: &str, port: u16) -> String {
    format!("http://{}:{}", host, port)
}

/// Format a connection error message for when the daemon is not reachable.
pub fn connection_error_message(host: &str, port: u16) -> String {
    format!(
        "Could not connect to daemon at {}:{}. Is it running? (try: translateable serve)",
        host, port
    )
}

/// Helper to handle reqwest errors and produce a user-friendly connection error.
pub fn handle_request_error(err: reqwest::Error, host: &str, port: u16) -> anyhow::Error {
    if err.is_connect() || err.is_timeout() {
        anyhow::anyhow!("{}", connection_error_message(host, port))
    } else {
        anyhow::anyhow!("Request failed: {}", err)
    }
}

/// Dispatch the CLI command to the appropriate handler.
pub async fn dispatch(cli: &Cli) -> anyhow::Result<()> {
    let (host, port) = (cli.host.as_str(), cli.port);
    match &cli.command {
        Some(Commands::Serve {
            config,
            listen_port,
            bind,
            data_dir,
        }) => {
            daemon::cmd_serve(
                config.as_deref(),
                bind.as_deref(),
                *listen_port,
                data_dir.as_deref(),
            )
            .await
        }
        Some(Commands::Submit {
            files,
            url,
            target_language,
            source_language,
            title,
            fail_fast,
            wait,
        }) => {
            let request = jobs::SubmitArgs {
                files,
                url: url.as_deref(),
                target_language,
                source_language: source_language.as_deref(),
                title: title.as_deref(),
                fail_fast: *fail_fast,
            };
            jobs::cmd_submit(host, port, &request, *wait).await
        }
        Some(Commands::List {
            status,
            query,
            page,
            per_page,
            oldest,
            json,
        }) => {
            jobs::cmd_list(
                host,
                port,
                &jobs::ListArgs {
                    status: status.as_deref(),
                    query: query.as_deref(),
                    page: *page,
                    per_page: *per_page,
                    oldest: *oldest,
                },
                *json,
            )
            .await
        }
        Some(Commands::Status { job, json }) => jobs::cmd_status(host, port, job, *json).await,
        Some(Commands::Cancel { job }) => jobs::cmd_cancel(host, port, job).await,
        Some(Commands::Delete { job, yes }) => jobs::cmd_delete(host, port, job, *yes).await,
        Some(Commands::Download { job, output, page }) => {
            jobs::cmd_download(host, port, job, output.as_deref(), *page).await
        }
        Some(Commands::Health) => daemon::cmd_health(host, port, cli.verbose).await,
        None => {
            use clap::CommandFactory;
            Cli::command().print_help()?;
            println!();
            Ok(())
        }
    }
}
