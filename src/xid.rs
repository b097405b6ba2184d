/// Catalog of NVIDIA driver XID codes the simulators know how to describe.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XidCategory {
    Memory,
    Bus,
    NvLink,
    Engine,
    Firmware,
}

impl std::fmt::Display for XidCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            XidCategory::Memory   => f.pad("memory"),
            XidCategory::Bus      => f.pad("bus"),
            XidCategory::NvLink   => f.pad("nvlink"),
            XidCategory::Engine   => f.pad("engine"),
            XidCategory::Firmware => f.pad("firmware"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct XidInfo {
    pub code: u32,
    pub description: &'static str,
    pub category: XidCategory,
    pub action: &'static str,
}

const CATALOG: &[XidInfo] = &[
    XidInfo { code: 13, description: "Graphics Engine Exception", category: XidCategory::Engine, action: "Run diagnostics; check application for illegal memory access" },
    XidInfo { code: 31, description: "GPU memory page fault", category: XidCategory::Engine, action: "Debug the application; if persistent run dcgmi diag -r 3" },
    XidInfo { code: 43, description: "GPU stopped processing", category: XidCategory::Engine, action: "Restart the application" },
    XidInfo { code: 45, description: "Preemptive cleanup, due to previous errors", category: XidCategory::Engine, action: "Check for earlier XID events" },
    XidInfo { code: 48, description: "Double Bit ECC Error", category: XidCategory::Memory, action: "Drain node, reset GPU, check row remapping" },
    XidInfo { code: 61, description: "Internal micro-controller breakpoint/warning", category: XidCategory::Firmware, action: "Reset GPU; collect nvidia-bug-report" },
    XidInfo { code: 62, description: "Internal micro-controller halt", category: XidCategory::Firmware, action: "Reset GPU; collect nvidia-bug-report" },
    XidInfo { code: 63, description: "ECC page retirement or row remapping recording event", category: XidCategory::Memory, action: "Reset GPU to apply row remap" },
    XidInfo { code: 64, description: "ECC page retirement or row remapper recording failure", category: XidCategory::Memory, action: "Drain node and RMA the GPU" },
    XidInfo { code: 74, description: "NVLink Error", category: XidCategory::NvLink, action: "Check nvidia-smi nvlink -e and fabric manager logs" },
    XidInfo { code: 79, description: "GPU has fallen off the bus", category: XidCategory::Bus, action: "Drain node, power cycle, reseat GPU if it recurs" },
    XidInfo { code: 92, description: "High single-bit ECC error rate", category: XidCategory::Memory, action: "Monitor; schedule GPU reset" },
    XidInfo { code: 94, description: "Contained ECC error", category: XidCategory::Memory, action: "Restart affected application; reset GPU" },
    XidInfo { code: 95, description: "Uncontained ECC error", category: XidCategory::Memory, action: "Drain node and reset GPU" },
    XidInfo { code: 119, description: "GSP RPC Timeout", category: XidCategory::Firmware, action: "Reset GPU; update driver if it recurs" },
    XidInfo { code: 120, description: "GSP Error", category: XidCategory::Firmware, action: "Reset GPU; collect nvidia-bug-report" },
];

/// Look up a known XID code.
pub fn lookup(code: u32) -> Option<&'static XidInfo> {
    CATALOG.iter().find(|x| x.code == code)
}

pub fn description(code: u32) -> &'static str {
    lookup(code).map(|x| x.description).unwrap_or("Unknown XID")
}

pub fn category(code: u32) -> XidCategory {
    lookup(code).map(|x| x.category).unwrap_or(XidCategory::Engine)
}

pub fn all() -> &'static [XidInfo] {
    CATALOG
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_resolve() {
        assert_eq!(description(79), "GPU has fallen off the bus");
        assert_eq!(category(48), XidCategory::Memory);
    }

    #[test]
    fn unknown_codes_fall_back_to_engine() {
        assert_eq!(description(9999), "Unknown XID");
        assert_eq!(category(9999), XidCategory::Engine);
    }
}
