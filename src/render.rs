use std::fmt::{self, Write};

use crate::types::{ProxyConfig, FALLBACK_ADDRESS};

/// Renders `config` in nghttpx configuration file syntax.
pub fn render(config: &ProxyConfig) -> Result<String, fmt::Error> {
    let mut doc = String::new();
    writeln!(doc, "frontend=*,{};no-tls", config.ports.no_tls)?;
    writeln!(doc, "frontend=*,{};tls", config.ports.tls)?;
    for route in &config.backends {
        writeln!(
            doc,
            "backend={},{};{}{};proto=h2;",
            route.address, route.port, route.hostname, route.path
        )?;
    }
    writeln!(doc, "backend={},{};;", FALLBACK_ADDRESS, config.ports.fallback)?;
    for binding in &config.tls_bindings {
        writeln!(
            doc,
            "subcert={}:{}",
            binding.key_path.display(),
            binding.cert_path.display()
        )?;
    }
    Ok(doc)
}
