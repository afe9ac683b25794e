//! Generated MCP server specs and their injection into a backend's list.
//!
//! The backend config is never mutated in place: [`BackendConfigBuilder`]
//! takes the user's specs and returns a new list with the supervisor-generated
//! servers appended (and, under MCP-inside-Docker, with each generated spec
//! rewritten to a `docker exec` wrapper).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use plait::mcp::spec::{ServerSpec, TransportSpec};
use plait::mcp::security;
use tracing::{debug, warn};

use crate::manager::FilesystemManager;

/// Options for the optional `command_line` server.
#[derive(Clone, Debug, Default)]
pub struct CommandLineOptions {
    pub enabled: bool,
    /// Regex filters the server applies to incoming commands.
    pub allowed_commands: Vec<String>,
    pub blocked_commands: Vec<String>,
    /// Prefix prepended to every command (e.g. `uv run`).
    pub command_prefix: Option<String>,
    pub venv_path: Option<PathBuf>,
    pub timeout_secs: Option<u64>,
    pub max_output_bytes: Option<u64>,
}

/// What to generate and how.
#[derive(Clone, Debug)]
pub struct InjectOptions {
    /// `fastmcp` entry script for the workspace tools server.
    pub workspace_tools_script: PathBuf,
    /// `fastmcp` entry script for the command line server.
    pub command_line_script: PathBuf,
    pub command_line: CommandLineOptions,
    pub enable_image_generation: bool,
    /// When set, generated specs are rewritten to run inside this container
    /// via `docker exec -i -w /workspace <container> …`.
    pub docker_container: Option<String>,
}

impl Default for InjectOptions {
    fn default() -> Self {
        Self {
            workspace_tools_script: PathBuf::from("plait_servers/workspace_tools.py"),
            command_line_script: PathBuf::from("plait_servers/command_line.py"),
            command_line: CommandLineOptions::default(),
            enable_image_generation: false,
            docker_container: None,
        }
    }
}

/// Builds the auto-injected server list for one agent.
pub struct BackendConfigBuilder<'a> {
    manager: &'a FilesystemManager,
    options: InjectOptions,
}

impl<'a> BackendConfigBuilder<'a> {
    pub fn new(manager: &'a FilesystemManager, options: InjectOptions) -> Self {
        Self { manager, options }
    }

    /// Returns `user_specs` plus the generated servers that are not already
    /// present by name.
    pub fn inject(&self, user_specs: Vec<ServerSpec>) -> Vec<ServerSpec> {
        let mut specs = user_specs;
        let existing: Vec<String> = specs.iter().map(|s| s.name.clone()).collect();

        for generated in self.generated_specs() {
            if existing.iter().any(|name| *name == generated.name) {
                warn!(server = %generated.name, "custom server already present, not injecting");
                continue;
            }
            specs.push(generated);
        }
        specs
    }

    fn generated_specs(&self) -> Vec<ServerSpec> {
        let mut generated = vec![self.filesystem_spec(), self.workspace_tools_spec()];
        if self.options.command_line.enabled {
            generated.push(self.command_line_spec());
        }
        if let Some(container) = &self.options.docker_container {
            generated = generated
                .into_iter()
                .map(|spec| wrap_with_docker_exec(spec, container))
                .collect();
        }
        generated
    }

    /// The standard filesystem server over every managed directory;
    /// `read_media_file` is excluded because workspace tools carry their own.
    fn filesystem_spec(&self) -> ServerSpec {
        let permissions = self.manager.permission_manager();
        let mut args = vec![
            "-y".to_string(),
            "@modelcontextprotocol/server-filesystem".to_string(),
        ];
        args.extend(permissions.mcp_filesystem_paths());

        ServerSpec {
            name: "filesystem".to_string(),
            transport: TransportSpec::Stdio {
                command: Some("npx".to_string()),
                args,
                env: HashMap::new(),
                cwd: Some(self.manager.workspace().to_path_buf()),
            },
            allowed_tools: Vec::new(),
            exclude_tools: vec!["read_media_file".to_string()],
            security: Default::default(),
        }
    }

    /// Custom copy/delete/compare server, plus image generation when enabled.
    fn workspace_tools_spec(&self) -> ServerSpec {
        let permissions = self.manager.permission_manager();
        let mut args = fastmcp_args(&self.options.workspace_tools_script);
        args.push("--allowed-paths".to_string());
        args.extend(permissions.mcp_filesystem_paths());

        let exclude_tools = if self.options.enable_image_generation {
            Vec::new()
        } else {
            vec![
                "generate_and_store_image_with_input_images".to_string(),
                "generate_and_store_image_no_input_images".to_string(),
            ]
        };

        ServerSpec {
            name: "workspace_tools".to_string(),
            transport: TransportSpec::Stdio {
                command: Some("fastmcp".to_string()),
                args,
                env: fastmcp_env(),
                cwd: Some(self.manager.workspace().to_path_buf()),
            },
            allowed_tools: Vec::new(),
            exclude_tools,
            security: Default::default(),
        }
    }

    /// `execute_command` server with allow/block filters and execution
    /// environment flags.
    fn command_line_spec(&self) -> ServerSpec {
        let permissions = self.manager.permission_manager();
        let opts = &self.options.command_line;
        let mut args = fastmcp_args(&self.options.command_line_script);
        args.push("--allowed-paths".to_string());
        args.extend(permissions.mcp_filesystem_paths());

        if !opts.allowed_commands.is_empty() {
            args.push("--allowed-commands".to_string());
            args.extend(opts.allowed_commands.iter().cloned());
        }
        if !opts.blocked_commands.is_empty() {
            args.push("--blocked-commands".to_string());
            args.extend(opts.blocked_commands.iter().cloned());
        }
        if let Some(prefix) = &opts.command_prefix {
            args.push("--command-prefix".to_string());
            args.push(prefix.clone());
        }
        if let Some(venv) = &opts.venv_path {
            args.push("--venv-path".to_string());
            args.push(venv.display().to_string());
        }
        if let Some(timeout) = opts.timeout_secs {
            args.push("--timeout".to_string());
            args.push(timeout.to_string());
        }
        if let Some(cap) = opts.max_output_bytes {
            args.push("--max-output-bytes".to_string());
            args.push(cap.to_string());
        }

        ServerSpec {
            name: "command_line".to_string(),
            transport: TransportSpec::Stdio {
                command: Some("fastmcp".to_string()),
                args,
                env: fastmcp_env(),
                cwd: Some(self.manager.workspace().to_path_buf()),
            },
            allowed_tools: Vec::new(),
            exclude_tools: Vec::new(),
            security: Default::default(),
        }
    }
}

fn fastmcp_args(script: &Path) -> Vec<String> {
    vec![
        "run".to_string(),
        format!("{}:create_server", script.display()),
        "--".to_string(),
    ]
}

fn fastmcp_env() -> HashMap<String, String> {
    HashMap::from([("FASTMCP_SHOW_CLI_BANNER".to_string(), "false".to_string())])
}

/// Rewrites a stdio spec to run inside a container:
/// `docker exec -i -w /workspace <container> <original argv…>`. Env and tool
/// filters carry over; cwd does not (the `-w` flag replaces it).
pub fn wrap_with_docker_exec(spec: ServerSpec, container: &str) -> ServerSpec {
    let TransportSpec::Stdio { env, .. } = &spec.transport else {
        return spec;
    };
    let env = env.clone();
    let original = match security::stdio_argv(&spec) {
        Ok(argv) => argv,
        Err(e) => {
            warn!(server = %spec.name, error = %e, "cannot wrap spec for docker, leaving as is");
            return spec;
        }
    };

    let mut args = vec![
        "exec".to_string(),
        "-i".to_string(),
        "-w".to_string(),
        "/workspace".to_string(),
        container.to_string(),
    ];
    args.extend(original);
    debug!(server = %spec.name, container, "wrapped server to run inside container");

    ServerSpec {
        name: spec.name,
        transport: TransportSpec::Stdio {
            command: Some("docker".to_string()),
            args,
            env,
            cwd: None,
        },
        allowed_tools: spec.allowed_tools,
        exclude_tools: spec.exclude_tools,
        security: spec.security,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &Path) -> FilesystemManager {
        FilesystemManager::new(&dir.join("agents/a1/workspace"), "a1", false).unwrap()
    }

    #[test]
    fn injects_filesystem_and_workspace_tools_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let builder = BackendConfigBuilder::new(&manager, InjectOptions::default());

        let specs = builder.inject(vec![]);
        let names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["filesystem", "workspace_tools"]);

        let fs = &specs[0];
        match &fs.transport {
            TransportSpec::Stdio { command, args, .. } => {
                assert_eq!(command.as_deref(), Some("npx"));
                assert!(args.contains(&"@modelcontextprotocol/server-filesystem".to_string()));
                // Workspace path is the first allowed path.
                let ws = manager.workspace().display().to_string();
                assert!(args.contains(&ws));
            }
            other => panic!("unexpected transport: {:?}", other),
        }
        assert_eq!(fs.exclude_tools, vec!["read_media_file"]);
        // Generated specs pass the same validation as user specs.
        for spec in &specs {
            security::validate_server_spec(spec).unwrap();
        }
    }

    #[test]
    fn command_line_spec_carries_filters_and_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let options = InjectOptions {
            command_line: CommandLineOptions {
                enabled: true,
                allowed_commands: vec!["^cargo ".to_string()],
                blocked_commands: vec!["rm".to_string()],
                command_prefix: Some("uv run".to_string()),
                venv_path: None,
                timeout_secs: Some(120),
                max_output_bytes: Some(65536),
            },
            ..InjectOptions::default()
        };
        let builder = BackendConfigBuilder::new(&manager, options);

        let specs = builder.inject(vec![]);
        let cl = specs.iter().find(|s| s.name == "command_line").unwrap();
        match &cl.transport {
            TransportSpec::Stdio { args, .. } => {
                assert!(args.contains(&"--allowed-commands".to_string()));
                assert!(args.contains(&"--blocked-commands".to_string()));
                assert!(args.contains(&"--command-prefix".to_string()));
                assert!(args.contains(&"uv run".to_string()));
                assert!(args.contains(&"--timeout".to_string()));
            }
            other => panic!("unexpected transport: {:?}", other),
        }
    }

    #[test]
    fn existing_names_are_not_duplicated() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let builder = BackendConfigBuilder::new(&manager, InjectOptions::default());

        let user = vec![ServerSpec::stdio(
            "filesystem",
            vec!["npx".into(), "-y".into(), "my-own-fs".into()],
        )];
        let specs = builder.inject(user);
        let fs_count = specs.iter().filter(|s| s.name == "filesystem").count();
        assert_eq!(fs_count, 1);
        assert!(specs.iter().any(|s| s.name == "workspace_tools"));
    }

    #[test]
    fn docker_rewrite_wraps_generated_commands() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let options = InjectOptions {
            docker_container: Some("plait-early-abc123".to_string()),
            ..InjectOptions::default()
        };
        let builder = BackendConfigBuilder::new(&manager, options);

        let specs = builder.inject(vec![]);
        for spec in specs {
            match &spec.transport {
                TransportSpec::Stdio { command, args, cwd, .. } => {
                    assert_eq!(command.as_deref(), Some("docker"));
                    assert_eq!(args[0], "exec");
                    assert_eq!(args[1], "-i");
                    assert_eq!(args[2], "-w");
                    assert_eq!(args[3], "/workspace");
                    assert_eq!(args[4], "plait-early-abc123");
                    assert!(cwd.is_none());
                }
                other => panic!("unexpected transport: {:?}", other),
            }
        }
    }
}
