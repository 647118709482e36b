pub mod paths;

/// Delimiter used when namespacing a tool name by its owning server, to
/// disambiguate identically-named tools across servers (spec §3, ToolDescriptor
/// invariant). Kept as a named constant rather than inlined, the way
/// `chat-cli::util::MCP_SERVER_TOOL_DELIMITER` does it.
pub const MCP_SERVER_TOOL_DELIMITER: char = '_';
