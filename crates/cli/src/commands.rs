use clap::Subcommand;

#[derive(Subcommand)]
pub enum Commands {
    /// Run the replication worker for one flow config until shutdown
    Worker {
        #[arg(long, help = "Flow config file path (JSON)")]
        config: String,

        #[arg(long, help = "Extra environment file to load (KEY=VALUE lines)")]
        env_file: Option<String>,

        #[arg(long, help = "Directory for durable flow state (defaults to ~/.sluice/state)")]
        state_dir: Option<String>,
    },
    /// Run only the setup and initial-copy phase of a CDC flow, then exit
    SnapshotWorker {
        #[arg(long, help = "Flow config file path (JSON)")]
        config: String,

        #[arg(long, help = "Extra environment file to load (KEY=VALUE lines)")]
        env_file: Option<String>,

        #[arg(long, help = "Directory for durable flow state (defaults to ~/.sluice/state)")]
        state_dir: Option<String>,
    },
    /// Tear a flow down on both peers and forget its durable state
    DropFlow {
        #[arg(long, help = "Flow config file path (JSON)")]
        config: String,

        #[arg(long, help = "Extra environment file to load (KEY=VALUE lines)")]
        env_file: Option<String>,

        #[arg(long, help = "Directory for durable flow state (defaults to ~/.sluice/state)")]
        state_dir: Option<String>,
    },
    /// Show the persisted progress of a flow
    Status {
        #[arg(long, help = "Flow job name to inspect")]
        job: String,

        #[arg(long, help = "Directory for durable flow state (defaults to ~/.sluice/state)")]
        state_dir: Option<String>,

        #[arg(long, help = "Print as JSON instead of a table")]
        json: bool,
    },
}
