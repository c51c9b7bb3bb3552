//! Command-line definitions

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "mcpmu")]
#[command(about = "Aggregating gateway for the Model Context Protocol")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path (default: the per-user config directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Add a downstream server
    Add(AddArgs),

    /// Remove a server and every reference to it
    Remove {
        /// Server name
        name: String,
    },

    /// Rename a server, rewriting namespaces, permissions, and the cache
    Rename {
        /// Current name
        old: String,
        /// New name
        new: String,
    },

    /// List configured servers
    List,

    /// Manage namespaces
    #[command(subcommand)]
    Namespace(NamespaceCommands),

    /// Manage per-tool permissions
    #[command(subcommand)]
    Permission(PermissionCommands),

    /// OAuth credentials for streamable-http servers
    #[command(subcommand)]
    Mcp(McpCommands),

    /// Serve the aggregated gateway as an MCP server on stdio
    Serve {
        /// Namespace to export (default: config default, else auto)
        #[arg(long)]
        namespace: Option<String>,

        /// Include the mcpmu.* manager tools in tools/list output
        #[arg(long)]
        expose_manager_tools: bool,
    },
}

#[derive(Args)]
pub struct AddArgs {
    /// Server name (must not contain '.')
    pub name: String,

    /// Streamable-HTTP endpoint URL; omit for stdio servers
    #[arg(long)]
    pub url: Option<String>,

    /// Working directory for the child process (stdio)
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// KEY=VALUE environment additions for the child process (stdio)
    #[arg(long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Start this server eagerly when serving
    #[arg(long)]
    pub autostart: bool,

    /// Startup timeout in seconds
    #[arg(long)]
    pub startup_timeout: Option<u64>,

    /// Per-call tool timeout in seconds
    #[arg(long)]
    pub tool_timeout: Option<u64>,

    /// OAuth scope to request; repeatable (HTTP)
    #[arg(long = "scope", value_name = "SCOPE")]
    pub scopes: Vec<String>,

    /// Environment variable holding a static bearer token (HTTP)
    #[arg(long = "bearer-env", value_name = "VAR")]
    pub bearer_env: Option<String>,

    /// NAME=VALUE header sent verbatim; repeatable (HTTP)
    #[arg(long = "header", value_name = "NAME=VALUE")]
    pub headers: Vec<String>,

    /// NAME=ENVVAR header resolved from the environment per request (HTTP)
    #[arg(long = "env-header", value_name = "NAME=ENVVAR")]
    pub env_headers: Vec<String>,

    /// Command and arguments for stdio servers, after `--`
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

#[derive(Subcommand)]
pub enum NamespaceCommands {
    /// Create a namespace
    Add {
        name: String,
        #[arg(long)]
        description: Option<String>,
    },

    /// Delete a namespace and its permissions
    Remove { name: String },

    /// List namespaces with their members
    List,

    /// Rename a namespace
    Rename { old: String, new: String },

    /// Add a server to a namespace
    Assign { namespace: String, server: String },

    /// Remove a server from a namespace
    Unassign { namespace: String, server: String },

    /// Set (or clear, with no argument) the default namespace
    Default { name: Option<String> },

    /// Toggle deny-by-default policy for a namespace
    SetDenyDefault {
        namespace: String,
        #[arg(value_name = "true|false")]
        deny: bool,
    },
}

#[derive(Subcommand)]
pub enum PermissionCommands {
    /// Allow or deny one tool in a namespace
    Set {
        namespace: String,
        server: String,
        /// Tool name; `server.tool` qualified input is accepted
        tool: String,
        action: PermissionAction,
    },

    /// Remove an explicit override
    Unset {
        namespace: String,
        server: String,
        tool: String,
    },

    /// List explicit overrides
    List {
        #[arg(long)]
        namespace: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum PermissionAction {
    Allow,
    Deny,
}

#[derive(Subcommand)]
pub enum McpCommands {
    /// Run the interactive OAuth flow for a streamable-http server
    Login {
        /// Server name
        server: String,
    },

    /// Delete stored credentials for a streamable-http server
    Logout {
        /// Server name
        server: String,
    },
}
