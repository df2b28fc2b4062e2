//! Egress policy data and file renderers.
//!
//! Everything here is a pure value: the same functions feed both initial
//! provisioning (files staged into the rootfs over RPC) and the runtime
//! `network set/allow/deny` path, so the two always produce identical bytes.

pub const DOMAINS_PATH: &str = "/etc/pixels-egress-domains";
pub const CIDRS_PATH: &str = "/etc/pixels-egress-cidrs";
pub const NFTABLES_PATH: &str = "/etc/nftables.conf";
pub const RESOLVE_SCRIPT_PATH: &str = "/usr/local/bin/pixels-resolve-egress.sh";
pub const SAFE_APT_PATH: &str = "/usr/local/bin/safe-apt";
pub const SUDOERS_PATH: &str = "/etc/sudoers.d/pixel";
pub const SUDOERS_STAGED_PATH: &str = "/usr/local/share/pixels/sudoers.restricted";
pub const SETUP_SCRIPT_PATH: &str = "/usr/local/bin/pixels-setup-egress.sh";
pub const ENABLE_SCRIPT_PATH: &str = "/usr/local/bin/pixels-enable-egress.sh";

/// Domain allowlist for the "agent" preset: AI APIs, package registries,
/// git hosting and release CDNs, and the Ubuntu mirrors apt needs once the
/// ruleset is loaded.
const AGENT_DOMAINS: &[&str] = &[
    // AI APIs
    "api.anthropic.com",
    "api.openai.com",
    "generativelanguage.googleapis.com",
    // Package registries
    "registry.npmjs.org",
    "pypi.org",
    "files.pythonhosted.org",
    "crates.io",
    "static.crates.io",
    "proxy.golang.org",
    "sum.golang.org",
    // Git + GitHub release CDN
    "github.com",
    "api.github.com",
    "gitlab.com",
    "objects.githubusercontent.com",
    "raw.githubusercontent.com",
    "codeload.github.com",
    "github-releases.githubusercontent.com",
    "tmaproduction.blob.core.windows.net",
    // Sigstore (GitHub release attestation verification)
    "tuf-repo-cdn.sigstore.dev",
    // SDK / tool downloads
    "dl.google.com",
    // Tools
    "mise.run",
    "mise.jdx.dev",
    "nodejs.org",
    // Ubuntu package repos (needed for apt-get after egress rules are loaded)
    "archive.ubuntu.com",
    "security.ubuntu.com",
];

/// Static ranges for the "agent" preset. GitHub serves some release traffic
/// from addresses its public hostnames never resolve to, so DNS-based rules
/// alone break large downloads.
const AGENT_CIDRS: &[&str] = &[
    "140.82.112.0/20",
    "143.55.64.0/20",
    "185.199.108.0/22",
    "192.30.252.0/22",
];

/// Returns the built-in domain preset for a mode, or `None` when the mode
/// has no preset.
pub fn preset_domains(mode: &str) -> Option<&'static [&'static str]> {
    match mode {
        "agent" => Some(AGENT_DOMAINS),
        _ => None,
    }
}

/// Returns the built-in CIDR preset for a mode. Empty for modes without one.
pub fn preset_cidrs(mode: &str) -> &'static [&'static str] {
    match mode {
        "agent" => AGENT_CIDRS,
        _ => &[],
    }
}

pub fn is_restricted(mode: &str) -> bool {
    mode == "agent" || mode == "allowlist"
}

/// Final domain list for an egress mode: preset first, extras appended,
/// duplicates removed, insertion order preserved. `None` for unrestricted
/// (and for unknown modes, which callers validate before getting here).
pub fn resolve_domains(mode: &str, allow: &[String]) -> Option<Vec<String>> {
    match mode {
        "agent" => {
            let preset = preset_domains(mode).unwrap_or(&[]);
            let mut seen = std::collections::HashSet::new();
            let mut merged = Vec::new();
            for d in preset.iter().map(|d| d.to_string()).chain(allow.iter().cloned()) {
                if seen.insert(d.clone()) {
                    merged.push(d);
                }
            }
            Some(merged)
        }
        "allowlist" => Some(allow.to_vec()),
        _ => None,
    }
}

/// Content of the domains file: one domain per line, trailing newline.
pub fn domains_file(domains: &[String]) -> String {
    format!("{}\n", domains.join("\n"))
}

/// Content of the CIDRs file, same shape as the domains file.
pub fn cidrs_file(cidrs: &[&str]) -> String {
    format!("{}\n", cidrs.join("\n"))
}

/// Base nftables ruleset: default-drop output with carve-outs for loopback,
/// established flows, DNS/DHCP, inbound-SSH replies, and the dynamically
/// populated `allowed_v4` set.
pub fn nftables_conf() -> &'static str {
    r#"#!/usr/sbin/nft -f
flush ruleset

table inet pixels_egress {
    set allowed_v4 {
        type ipv4_addr
        flags interval
    }

    chain output {
        type filter hook output priority 0; policy drop;

        oif lo accept
        ct state established,related accept
        udp dport 53 accept
        udp dport 67-68 accept
        tcp sport 22 accept

        ip daddr @allowed_v4 accept

        log prefix "pixels-egress-denied: " drop
    }
}
"#
}

/// Shell script that loads the base ruleset and populates `allowed_v4` from
/// the CIDRs file and the resolved addresses of each allowed domain.
pub fn resolve_script() -> &'static str {
    r#"#!/bin/bash
set -euo pipefail

DOMAIN_FILE="/etc/pixels-egress-domains"
CIDR_FILE="/etc/pixels-egress-cidrs"
NFT_CONF="/etc/nftables.conf"

if [ ! -f "$DOMAIN_FILE" ]; then
    echo "No domain file found, skipping egress setup"
    exit 0
fi

# Load the base ruleset (creates table and empty set).
nft -f "$NFT_CONF"

# Static ranges first.
if [ -f "$CIDR_FILE" ]; then
    while IFS= read -r cidr || [ -n "$cidr" ]; do
        cidr=$(echo "$cidr" | xargs)
        [ -z "$cidr" ] && continue
        [[ "$cidr" == \#* ]] && continue
        nft add element inet pixels_egress allowed_v4 "{ $cidr }" 2>/dev/null || true
    done < "$CIDR_FILE"
fi

# Resolve each domain and add its addresses to the allowed set.
while IFS= read -r domain || [ -n "$domain" ]; do
    domain=$(echo "$domain" | xargs)
    [ -z "$domain" ] && continue
    [[ "$domain" == \#* ]] && continue

    ips=$(getent ahostsv4 "$domain" 2>/dev/null | awk '{print $1}' | sort -u || true)
    for ip in $ips; do
        nft add element inet pixels_egress allowed_v4 "{ $ip }" 2>/dev/null || true
    done
done < "$DOMAIN_FILE"

echo "Egress rules loaded: $(nft list set inet pixels_egress allowed_v4 | grep -c 'elements' || echo 0) entries"
"#
}

/// Restricted sudoers: package management only through the safe-apt
/// wrapper, plus a curated set of service and status commands.
pub fn sudoers_restricted() -> &'static str {
    r#"pixel ALL=(ALL) NOPASSWD: /usr/local/bin/safe-apt, \
    /usr/bin/dpkg-query, \
    /usr/bin/systemctl start *, /usr/bin/systemctl stop *, \
    /usr/bin/systemctl restart *, /usr/bin/systemctl status *, \
    /usr/bin/systemctl enable *, /usr/bin/systemctl disable *, \
    /usr/bin/journalctl, /usr/bin/journalctl *, \
    /usr/bin/test, \
    /usr/sbin/nft list *
"#
}

/// Blanket passwordless sudo, used while egress is unrestricted.
pub fn sudoers_unrestricted() -> &'static str {
    "pixel ALL=(ALL) NOPASSWD: ALL\n"
}

/// Wrapper exposing a safe subset of apt-get. Option-injection flags are
/// refused: `-o APT::Update::Pre-Invoke=...` runs arbitrary commands as
/// root, which would void the restricted sudoers.
pub fn safe_apt_script() -> &'static str {
    r#"#!/bin/bash
set -euo pipefail

usage() {
    echo "usage: safe-apt <update|install|remove|purge|autoremove|list|search|show> [args]" >&2
    exit 2
}

[ $# -ge 1 ] || usage
sub="$1"
shift

case "$sub" in
    update|install|remove|purge|autoremove|list|search|show) ;;
    *) usage ;;
esac

for arg in "$@"; do
    case "$arg" in
        -o*|--option*|-c*|--config-file*)
            echo "safe-apt: configuration flags are not allowed" >&2
            exit 2
            ;;
    esac
done

export DEBIAN_FRONTEND=noninteractive
exec /usr/bin/apt-get "$sub" -y -q "$@"
"#
}

/// Provisioning step that installs the egress tooling while the network is
/// still open. confold keeps the pre-staged /etc/nftables.conf.
pub fn setup_egress_script() -> &'static str {
    r#"#!/bin/bash
set -euo pipefail
export DEBIAN_FRONTEND=noninteractive
apt-get update -qq
apt-get install -y -qq -o Dpkg::Options::="--force-confold" nftables dnsutils
"#
}

/// Finalize hook: loads the ruleset and swaps in the restricted sudoers.
/// Runs only after every provisioning step has succeeded, so installers
/// keep an open network until the very end.
pub fn enable_egress_script() -> &'static str {
    r#"#!/bin/bash
set -euo pipefail

/usr/local/bin/pixels-resolve-egress.sh

if [ -f /usr/local/share/pixels/sudoers.restricted ]; then
    install -m 0440 /usr/local/share/pixels/sudoers.restricted /etc/sudoers.d/pixel
fi
"#
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strs(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn agent_preset_covers_critical_domains() {
        let domains = preset_domains("agent").unwrap();
        for required in [
            "api.anthropic.com",
            "api.openai.com",
            "registry.npmjs.org",
            "github.com",
            "pypi.org",
        ] {
            assert!(domains.contains(&required), "missing {required}");
        }
    }

    #[test]
    fn unknown_preset_is_none() {
        assert!(preset_domains("nonexistent").is_none());
        assert!(preset_cidrs("nonexistent").is_empty());
    }

    #[test]
    fn unrestricted_resolves_to_none() {
        assert_eq!(resolve_domains("unrestricted", &strs(&["a.com"])), None);
    }

    #[test]
    fn agent_merges_extras_after_preset() {
        let merged = resolve_domains("agent", &strs(&["custom.example.com"])).unwrap();
        assert_eq!(merged.first().map(String::as_str), Some("api.anthropic.com"));
        assert_eq!(merged.last().map(String::as_str), Some("custom.example.com"));
        assert_eq!(merged.len(), AGENT_DOMAINS.len() + 1);
    }

    #[test]
    fn resolve_deduplicates_preserving_order() {
        let merged = resolve_domains("agent", &strs(&["github.com", "x.com", "x.com"])).unwrap();
        let mut seen = std::collections::HashSet::new();
        for d in &merged {
            assert!(seen.insert(d.clone()), "duplicate domain {d}");
        }
        // github.com stays at its preset position, x.com appended once.
        assert_eq!(merged.iter().filter(|d| d.as_str() == "github.com").count(), 1);
        assert_eq!(merged.last().map(String::as_str), Some("x.com"));
    }

    #[test]
    fn allowlist_uses_extras_only() {
        let merged = resolve_domains("allowlist", &strs(&["a.com", "b.com"])).unwrap();
        assert_eq!(merged, strs(&["a.com", "b.com"]));
        assert_eq!(resolve_domains("allowlist", &[]).unwrap(), Vec::<String>::new());
    }

    #[test]
    fn domains_file_one_per_line_with_trailing_newline() {
        let content = domains_file(&strs(&["api.anthropic.com", "github.com"]));
        assert_eq!(content, "api.anthropic.com\ngithub.com\n");
    }

    #[test]
    fn nftables_conf_shape() {
        let conf = nftables_conf();
        assert!(conf.contains("table inet pixels_egress"));
        assert!(conf.contains("policy drop"));
        assert!(conf.contains("@allowed_v4"));
        assert!(conf.contains("oif lo accept"));
        assert!(conf.contains("ct state established,related accept"));
        assert!(conf.contains("udp dport 53 accept"));
        assert!(conf.contains("log prefix \"pixels-egress-denied: \" drop"));
    }

    #[test]
    fn resolve_script_reads_both_files() {
        let script = resolve_script();
        assert!(script.starts_with("#!/bin/bash"));
        assert!(script.contains("pixels-egress-domains"));
        assert!(script.contains("pixels-egress-cidrs"));
        assert!(script.contains("nft -f"));
    }

    #[test]
    fn restricted_sudoers_goes_through_safe_apt() {
        let s = sudoers_restricted();
        assert!(s.contains("/usr/local/bin/safe-apt"));
        assert!(!s.contains("/usr/bin/apt-get"));
        assert!(!s.contains("NOPASSWD: ALL"));
        assert!(s.contains("/usr/bin/journalctl"));
    }

    #[test]
    fn unrestricted_sudoers_is_blanket() {
        assert!(sudoers_unrestricted().contains("NOPASSWD: ALL"));
    }

    #[test]
    fn safe_apt_blocks_option_injection() {
        let s = safe_apt_script();
        assert!(s.contains("-o*|--option*"));
        assert!(s.contains("--config-file"));
        assert!(s.contains("exec /usr/bin/apt-get"));
        // Whitelisted subcommands only.
        assert!(s.contains("update|install|remove|purge|autoremove|list|search|show"));
    }

    #[test]
    fn enable_script_defers_lockdown_artifacts() {
        let s = enable_egress_script();
        assert!(s.contains(RESOLVE_SCRIPT_PATH));
        assert!(s.contains("sudoers.restricted"));
        assert!(s.contains("/etc/sudoers.d/pixel"));
    }
}
