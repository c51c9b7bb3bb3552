use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod commands;

use cli::{Cli, Commands, McpCommands, NamespaceCommands, PermissionCommands};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // All logging goes to stderr: in `serve` mode stdout carries the MCP
    // protocol stream.
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.as_deref();
    let result = match cli.command {
        Commands::Add(args) => commands::server::add(config_path, args),
        Commands::Remove { name } => commands::server::remove(config_path, &name).await,
        Commands::Rename { old, new } => commands::server::rename(config_path, &old, &new).await,
        Commands::List => commands::server::list(config_path).await,
        Commands::Namespace(cmd) => match cmd {
            NamespaceCommands::Add { name, description } => {
                commands::namespace::add(config_path, &name, description.as_deref())
            }
            NamespaceCommands::Remove { name } => commands::namespace::remove(config_path, &name),
            NamespaceCommands::List => commands::namespace::list(config_path),
            NamespaceCommands::Rename { old, new } => {
                commands::namespace::rename(config_path, &old, &new)
            }
            NamespaceCommands::Assign { namespace, server } => {
                commands::namespace::assign(config_path, &namespace, &server)
            }
            NamespaceCommands::Unassign { namespace, server } => {
                commands::namespace::unassign(config_path, &namespace, &server)
            }
            NamespaceCommands::Default { name } => {
                commands::namespace::set_default(config_path, name.as_deref())
            }
            NamespaceCommands::SetDenyDefault { namespace, deny } => {
                commands::namespace::set_deny_default(config_path, &namespace, deny)
            }
        },
        Commands::Permission(cmd) => match cmd {
            PermissionCommands::Set {
                namespace,
                server,
                tool,
                action,
            } => commands::permission::set(config_path, &namespace, &server, &tool, action),
            PermissionCommands::Unset {
                namespace,
                server,
                tool,
            } => commands::permission::unset(config_path, &namespace, &server, &tool),
            PermissionCommands::List { namespace } => {
                commands::permission::list(config_path, namespace.as_deref())
            }
        },
        Commands::Mcp(cmd) => match cmd {
            McpCommands::Login { server } => commands::auth::login(config_path, &server).await,
            McpCommands::Logout { server } => commands::auth::logout(config_path, &server).await,
        },
        Commands::Serve {
            namespace,
            expose_manager_tools,
        } => {
            commands::serve::serve(config_path, namespace.as_deref(), expose_manager_tools).await
        }
    };

    if let Err(err) = result {
        eprintln!("mcpmu: {err}");
        std::process::exit(1);
    }
}
