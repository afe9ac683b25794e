//! Security validation and sanitization for MCP server configs and tool calls.
//!
//! Pure functions, no I/O (DNS resolution is opt-in per spec policy). All
//! server-config validation flows through [`validate_server_spec`].

use std::collections::HashSet;
use std::net::{IpAddr, ToSocketAddrs};
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use url::Url;

use crate::error::McpError;
use crate::mcp::spec::{SecurityLevel, SecurityOverrides, ServerSpec, TransportSpec};

/// Maximum length of a composed external tool name (`mcp__<server>__<tool>`).
pub const MAX_EXTERNAL_TOOL_NAME: usize = 200;

const MAX_COMMAND_LENGTH: usize = 1000;
const MAX_ARG_LENGTH: usize = 500;
const MAX_ARGS: usize = 50;
const MAX_URL_LENGTH: usize = 2048;

const MAX_ARGUMENTS_BYTES: usize = 10_000;
const MAX_ARGUMENTS_DEPTH: usize = 5;
const MAX_LIST_ITEMS: usize = 1000;
const MAX_STRING_CHARS: usize = 10_000;
const MAX_DICT_KEYS: usize = 100;

/// TCP ports never allowed in server URLs (SSH, SMB, databases, RDP, ...).
const DANGEROUS_PORTS: [u16; 13] = [
    22, 23, 25, 53, 135, 139, 445, 1433, 1521, 3306, 3389, 5432, 6379,
];

static SERVER_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());
static TOOL_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.-]+$").unwrap());

/// Shell constructs that must never appear in a server command.
static DANGEROUS_COMMAND_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\$\{.*\}",  // variable expansion
        r"\$\(.*\)",  // command substitution
        r"`.*`",      // backtick substitution
        r"\.\./",     // directory traversal
        r"\\\.\\",    // windows traversal
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Tool basenames reserved for the host; servers may not shadow them.
static RESERVED_TOOL_NAMES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "connect", "disconnect", "list", "help", "version", "status", "health", "ping", "echo",
        "test", "debug", "admin", "system", "config", "settings", "auth", "login", "logout",
        "exit", "quit",
    ]
    .into_iter()
    .collect()
});

fn default_allowed_executables(level: SecurityLevel) -> HashSet<&'static str> {
    let base: HashSet<&'static str> = [
        // Python interpreters
        "python", "python3", "python3.10", "python3.11", "python3.12", "python3.13", "py",
        // Python package managers
        "uv", "uvx", "pipx", "pip", "pip3", "fastmcp",
        // Node.js ecosystem
        "node", "npm", "npx", "yarn", "pnpm", "bun",
        // Other runtimes
        "deno", "java", "ruby", "go", "cargo", "docker",
        // Shells (limited set)
        "sh", "bash", "zsh", "fish", "powershell", "pwsh", "cmd",
    ]
    .into_iter()
    .collect();
    match level {
        SecurityLevel::Strict => base,
        SecurityLevel::Moderate => {
            let mut s = base;
            s.insert("git");
            s
        }
        SecurityLevel::Permissive => {
            let mut s = base;
            s.extend(["git", "curl", "wget"]);
            s
        }
    }
}

/// Sanitizes a command string and splits it into argv.
///
/// Rejects shell metacharacters, substitution patterns and parent traversal;
/// parses with shell-like quoting; bounds total length (≤1000), per-arg length
/// (≤500) and arg count (≤50); checks the executable base-name against the
/// level allowlist (or the explicit override).
pub fn prepare_command(
    command: &str,
    level: SecurityLevel,
    allowed_executables: Option<&HashSet<String>>,
) -> Result<Vec<String>, McpError> {
    if command.trim().is_empty() {
        return Err(McpError::config("MCP command cannot be empty"));
    }
    if command.len() > MAX_COMMAND_LENGTH {
        return Err(McpError::config(format!(
            "MCP command too long: {} > {} characters",
            command.len(),
            MAX_COMMAND_LENGTH
        )));
    }

    for meta in ["&&", "||", ">>", "<<", "&", "|", ";", "`", "$", "(", ")", "<", ">"] {
        if command.contains(meta) {
            return Err(McpError::config(format!(
                "MCP command cannot contain shell metacharacters: {}",
                meta
            )));
        }
    }
    for pattern in DANGEROUS_COMMAND_PATTERNS.iter() {
        if pattern.is_match(command) {
            return Err(McpError::config(format!(
                "MCP command contains dangerous pattern: {}",
                pattern.as_str()
            )));
        }
    }

    let parts = shlex::split(command)
        .ok_or_else(|| McpError::config("invalid command syntax (unbalanced quotes)"))?;
    if parts.is_empty() {
        return Err(McpError::config("MCP command cannot be empty after parsing"));
    }
    if parts.len() > MAX_ARGS {
        return Err(McpError::config(format!(
            "too many command arguments: {} > {}",
            parts.len(),
            MAX_ARGS
        )));
    }
    for (i, part) in parts.iter().enumerate() {
        if part.len() > MAX_ARG_LENGTH {
            return Err(McpError::config(format!(
                "command argument {} too long: {} > {} characters",
                i,
                part.len(),
                MAX_ARG_LENGTH
            )));
        }
    }

    let executable = Path::new(&parts[0]);
    if executable.components().any(|c| c.as_os_str() == "..") {
        return Err(McpError::config(
            "MCP command path cannot contain parent directory components ('..')",
        ));
    }

    // Base executable name, common Windows extensions stripped.
    let mut base_name = executable
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("")
        .to_lowercase();
    for ext in [".exe", ".bat", ".cmd", ".ps1"] {
        if let Some(stripped) = base_name.strip_suffix(ext) {
            base_name = stripped.to_string();
            break;
        }
    }

    let allowed_owned: HashSet<String> = match allowed_executables {
        Some(set) if !set.is_empty() => set.iter().map(|s| s.to_lowercase()).collect(),
        _ => default_allowed_executables(level)
            .into_iter()
            .map(str::to_string)
            .collect(),
    };
    if !allowed_owned.contains(&base_name) {
        return Err(McpError::config(format!(
            "MCP command executable '{}' is not allowed (level={:?})",
            base_name, level
        )));
    }

    Ok(parts)
}

fn is_forbidden_ip(ip: IpAddr, allow_private: bool) -> bool {
    if allow_private {
        return false;
    }
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_multicast()
                || v6.is_unspecified()
                // fe80::/10 link-local and fc00::/7 unique-local
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                || (v6.segments()[0] & 0xfe00) == 0xfc00
        }
    }
}

/// Validates a server URL for scheme, host, port and length.
///
/// Only http/https; the host must parse; loopback/private/link-local/reserved
/// addresses are rejected unless the overrides allow them; dangerous ports are
/// always rejected. When `resolve_dns` is set, every resolved address is
/// checked as well.
pub fn validate_url(raw: &str, overrides: &SecurityOverrides) -> Result<(), McpError> {
    if raw.is_empty() {
        return Err(McpError::config("URL must be a non-empty string"));
    }
    if raw.len() > MAX_URL_LENGTH {
        return Err(McpError::config(format!(
            "URL too long: {} > {} characters",
            raw.len(),
            MAX_URL_LENGTH
        )));
    }

    let parsed = Url::parse(raw).map_err(|e| McpError::config(format!("invalid URL: {}", e)))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            return Err(McpError::config(format!(
                "unsupported URL scheme: {}. Only http and https are allowed",
                other
            )))
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| McpError::config("URL must include a hostname"))?
        .to_lowercase();
    let host = host.trim_matches(['[', ']']).to_string();

    let allowlisted = overrides
        .allowed_hostnames
        .iter()
        .any(|h| h.to_lowercase() == host);
    if !allowlisted {
        if !overrides.allow_localhost && (host == "localhost" || host == "ip6-localhost") {
            return Err(McpError::config(format!(
                "hostname not allowed for security reasons: {}",
                host
            )));
        }

        if let Ok(ip) = host.parse::<IpAddr>() {
            let loopback_ok = overrides.allow_localhost && ip.is_loopback();
            if is_forbidden_ip(ip, overrides.allow_private_ips) && !loopback_ok {
                return Err(McpError::config(format!(
                    "IP address not allowed for security reasons: {}",
                    host
                )));
            }
        } else if overrides.resolve_dns {
            let port = parsed
                .port_or_known_default()
                .unwrap_or(if parsed.scheme() == "https" { 443 } else { 80 });
            let addrs = (host.as_str(), port).to_socket_addrs().map_err(|e| {
                McpError::config(format!("failed to resolve hostname '{}': {}", host, e))
            })?;
            for addr in addrs {
                let ip = addr.ip();
                let loopback_ok = overrides.allow_localhost && ip.is_loopback();
                if is_forbidden_ip(ip, overrides.allow_private_ips) && !loopback_ok {
                    return Err(McpError::config(format!(
                        "resolved IP not allowed for security reasons: {} -> {}",
                        host, ip
                    )));
                }
            }
        }
    }

    if let Some(port) = parsed.port() {
        if DANGEROUS_PORTS.contains(&port) {
            return Err(McpError::config(format!(
                "port {} is not allowed for security reasons",
                port
            )));
        }
    }

    Ok(())
}

fn env_denylist(level: SecurityLevel) -> HashSet<&'static str> {
    let mut deny: HashSet<&'static str> = [
        "LD_LIBRARY_PATH",
        "DYLD_LIBRARY_PATH",
        "PYTHONPATH",
        "PWD",
        "OLDPWD",
    ]
    .into_iter()
    .collect();
    if level == SecurityLevel::Strict {
        deny.extend(["PATH", "HOME", "USER", "USERNAME", "SHELL"]);
    }
    deny
}

/// Validates environment variables destined for a spawned server.
///
/// Per-level denylists (strict additionally blocks PATH/HOME/USER/SHELL);
/// shell metacharacters in values are rejected; key ≤100 chars, value ≤1000.
pub fn validate_env(
    env: &std::collections::HashMap<String, String>,
    level: SecurityLevel,
) -> Result<(), McpError> {
    let deny = env_denylist(level);
    for (key, value) in env {
        if key.len() > 100 {
            return Err(McpError::config(format!(
                "environment variable name too long: {} > 100",
                key.len()
            )));
        }
        if value.len() > 1000 {
            return Err(McpError::config(format!(
                "environment variable value too long: {} > 1000",
                value.len()
            )));
        }
        if deny.contains(key.to_uppercase().as_str()) {
            return Err(McpError::config(format!(
                "environment variable '{}' is not allowed for security reasons",
                key
            )));
        }
        for pattern in ["$(", "`", "${", "||", "&&", ";", "|"] {
            if value.contains(pattern) {
                return Err(McpError::config(format!(
                    "environment variable '{}' contains dangerous pattern: {}",
                    key, pattern
                )));
            }
        }
    }
    Ok(())
}

/// Composes and validates the external name `mcp__<server>__<tool>`.
///
/// Strips any stray `mcp__` prefix from the local name, rejects reserved
/// basenames and invalid characters, and bounds the composed name at 200.
pub fn sanitize_tool_name(tool_name: &str, server_name: &str) -> Result<String, McpError> {
    if tool_name.trim().is_empty() {
        return Err(McpError::validation("tool name must be a non-empty string"));
    }
    if server_name.trim().is_empty() {
        return Err(McpError::validation("server name must be a non-empty string"));
    }
    if tool_name.len() > 100 {
        return Err(McpError::validation(format!(
            "tool name too long: {} > 100 characters",
            tool_name.len()
        )));
    }

    // Strip an existing prefix so names never double-namespace.
    let mut local = tool_name.to_string();
    if let Some(stripped) = local.strip_prefix("mcp__") {
        local = match stripped.split_once("__") {
            Some((_, rest)) => rest.to_string(),
            None => stripped.to_string(),
        };
    }

    if RESERVED_TOOL_NAMES.contains(local.to_lowercase().as_str()) {
        return Err(McpError::validation(format!(
            "tool name '{}' is reserved and cannot be used",
            local
        )));
    }
    if !TOOL_NAME_RE.is_match(&local) {
        return Err(McpError::validation(format!(
            "tool name '{}' contains invalid characters (alphanumeric, underscore, hyphen, dot)",
            local
        )));
    }
    if !SERVER_NAME_RE.is_match(server_name) {
        return Err(McpError::validation(format!(
            "server name '{}' contains invalid characters (alphanumeric, underscore, hyphen)",
            server_name
        )));
    }

    let safe_server = server_name.trim_matches(['_', '-']);
    let safe_tool = local.trim_matches(['_', '-', '.']);
    if safe_server.is_empty() {
        return Err(McpError::validation(format!(
            "server name '{}' becomes empty after sanitization",
            server_name
        )));
    }
    if safe_tool.is_empty() {
        return Err(McpError::validation(format!(
            "tool name '{}' becomes empty after sanitization",
            tool_name
        )));
    }

    let external = format!("mcp__{}__{}", safe_server, safe_tool);
    if external.len() > MAX_EXTERNAL_TOOL_NAME {
        return Err(McpError::validation(format!(
            "final tool name too long: {} > {} characters",
            external.len(),
            MAX_EXTERNAL_TOOL_NAME
        )));
    }
    Ok(external)
}

/// Validates tool-call arguments: must be an object; recursively bounded by
/// serialized size (~10 KB), nesting depth (5), list items (1000), string
/// length (10 000 chars) and object size (100 keys).
pub fn validate_tool_arguments(arguments: &Value) -> Result<(), McpError> {
    if !arguments.is_object() {
        return Err(McpError::validation_field(
            "tool arguments must be an object",
            "arguments",
        ));
    }

    fn size_of_primitive(value: &Value) -> usize {
        match value {
            Value::Null => 4,
            Value::Bool(b) => {
                if *b {
                    4
                } else {
                    5
                }
            }
            Value::Number(n) => n.to_string().len(),
            Value::String(s) => s.chars().count() + 2,
            _ => 0,
        }
    }

    fn walk(value: &Value, depth: usize, size: &mut usize) -> Result<(), McpError> {
        if depth > MAX_ARGUMENTS_DEPTH {
            return Err(McpError::validation_field(
                format!(
                    "tool arguments nested too deeply: {} > {}",
                    depth, MAX_ARGUMENTS_DEPTH
                ),
                "arguments",
            ));
        }
        match value {
            Value::Object(map) => {
                if map.len() > MAX_DICT_KEYS {
                    return Err(McpError::validation_field(
                        format!("object too large: {} > {} keys", map.len(), MAX_DICT_KEYS),
                        "arguments",
                    ));
                }
                *size += 2;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        *size += 1;
                    }
                    *size += k.chars().count() + 3;
                    walk(v, depth + 1, size)?;
                    check(*size)?;
                }
            }
            Value::Array(items) => {
                if items.len() > MAX_LIST_ITEMS {
                    return Err(McpError::validation_field(
                        format!("list too large: {} > {} items", items.len(), MAX_LIST_ITEMS),
                        "arguments",
                    ));
                }
                *size += 2;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        *size += 1;
                    }
                    walk(item, depth + 1, size)?;
                    check(*size)?;
                }
            }
            Value::String(s) => {
                if s.chars().count() > MAX_STRING_CHARS {
                    return Err(McpError::validation_field(
                        format!(
                            "string too long: {} > {} characters",
                            s.chars().count(),
                            MAX_STRING_CHARS
                        ),
                        "arguments",
                    ));
                }
                *size += size_of_primitive(value);
                check(*size)?;
            }
            _ => {
                *size += size_of_primitive(value);
                check(*size)?;
            }
        }
        Ok(())
    }

    fn check(size: usize) -> Result<(), McpError> {
        if size > MAX_ARGUMENTS_BYTES {
            return Err(McpError::validation_field(
                format!("tool arguments too large: ~{} > {} bytes", size, MAX_ARGUMENTS_BYTES),
                "arguments",
            ));
        }
        Ok(())
    }

    let mut size = 0usize;
    walk(arguments, 0, &mut size)
}

/// Validates one server spec end to end (name, transport fields, security
/// policy). Called for every spec before any connection attempt.
pub fn validate_server_spec(spec: &ServerSpec) -> Result<(), McpError> {
    if spec.name.trim().is_empty() {
        return Err(McpError::config("server name must be a non-empty string"));
    }
    if spec.name.len() > 100 {
        return Err(McpError::config(format!(
            "server name too long: {} > 100 characters",
            spec.name.len()
        )));
    }
    if !SERVER_NAME_RE.is_match(&spec.name) {
        return Err(McpError::config(
            "server name can only contain alphanumeric characters, underscores, and hyphens",
        ));
    }

    match &spec.transport {
        TransportSpec::Stdio {
            command,
            args,
            env,
            cwd,
        } => {
            if command.as_deref().map_or(true, str::is_empty) && args.is_empty() {
                return Err(McpError::config(
                    "stdio server configuration must include 'command' or 'args'",
                ));
            }
            if let Some(cmd) = command.as_deref().filter(|c| !c.is_empty()) {
                let allowed: HashSet<String> =
                    spec.security.allowed_executables.iter().cloned().collect();
                let allowed = if allowed.is_empty() { None } else { Some(&allowed) };
                prepare_command(cmd, spec.security.level, allowed)?;
            }
            for (i, arg) in args.iter().enumerate() {
                if arg.len() > MAX_ARG_LENGTH {
                    return Err(McpError::config(format!(
                        "argument {} too long: {} > {} characters",
                        i,
                        arg.len(),
                        MAX_ARG_LENGTH
                    )));
                }
            }
            validate_env(env, spec.security.level)?;
            if let Some(cwd) = cwd {
                if cwd.components().any(|c| c.as_os_str() == "..") {
                    return Err(McpError::config(
                        "working directory cannot contain parent directory components ('..')",
                    ));
                }
            }
        }
        TransportSpec::StreamableHttp {
            url,
            headers,
            timeout,
            ..
        } => {
            validate_url(url, &spec.security)?;
            for (key, value) in headers {
                if key.len() > 100 {
                    return Err(McpError::config(format!(
                        "header name too long: {} > 100",
                        key.len()
                    )));
                }
                if value.len() > 1000 {
                    return Err(McpError::config(format!(
                        "header value too long: {} > 1000",
                        value.len()
                    )));
                }
            }
            if *timeout <= 0.0 || *timeout > 300.0 {
                return Err(McpError::config(format!(
                    "timeout must be in (0, 300] seconds, got {}",
                    timeout
                )));
            }
        }
    }
    Ok(())
}

/// Sanitized argv for a stdio spec: parsed `command` (when present) followed
/// by the literal `args`.
pub fn stdio_argv(spec: &ServerSpec) -> Result<Vec<String>, McpError> {
    match &spec.transport {
        TransportSpec::Stdio { command, args, .. } => {
            let mut argv = match command.as_deref().filter(|c| !c.is_empty()) {
                Some(cmd) => {
                    let allowed: HashSet<String> =
                        spec.security.allowed_executables.iter().cloned().collect();
                    let allowed = if allowed.is_empty() { None } else { Some(&allowed) };
                    prepare_command(cmd, spec.security.level, allowed)?
                }
                None => Vec::new(),
            };
            argv.extend(args.iter().cloned());
            if argv.is_empty() {
                return Err(McpError::config(format!(
                    "no command specified for stdio transport in {}",
                    spec.name
                )));
            }
            Ok(argv)
        }
        TransportSpec::StreamableHttp { .. } => Err(McpError::config(format!(
            "server {} is not a stdio server",
            spec.name
        ))),
    }
}
