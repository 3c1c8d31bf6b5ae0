//! `diskforge check`: verify the host tools a build shells out to.

use diskforge_common::constants::REQUIRED_TOOLS;
use diskforge_core::preflight::missing_tools;

use crate::output;

/// Executes the `check` command.
///
/// # Errors
///
/// Returns an error naming the missing tools, if any.
pub fn execute() -> anyhow::Result<()> {
    let missing = missing_tools(REQUIRED_TOOLS);
    output::print_tool_check(REQUIRED_TOOLS, &missing);
    if missing.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("{} required host tool(s) missing", missing.len())
    }
}
