use crate::error::{AgentError, AgentResult};

/// First non-loopback interface of the pod, in name order.
///
/// Inside a pod network namespace this is the veth carrying all traffic.
pub fn default_interface() -> AgentResult<String> {
    interfaces()?
        .into_iter()
        .find(|name| name != "lo")
        .ok_or(AgentError::NoInterface)
}

/// All interface names known to the kernel, sorted.
pub fn interfaces() -> AgentResult<Vec<String>> {
    let mut names: Vec<String> = std::fs::read_dir("/sys/class/net")?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();

    names.sort();

    Ok(names)
}
