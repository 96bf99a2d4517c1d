/// Asset-naming tokens for one target architecture: the AdGuardHome
/// release token and the Clash core token. `None` means no binary is
/// published for that architecture; the caller skips the asset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchTokens {
    pub adguard: Option<String>,
    pub clash: Option<String>,
}

fn tokens(adguard: &str, clash: Option<&str>) -> ArchTokens {
    ArchTokens {
        adguard: Some(adguard.to_string()),
        clash: clash.map(str::to_string),
    }
}

/// Fixed table keyed by the OpenWrt target architecture. ARM embeds the
/// ABI version when one is reported, falling back to the legacy v5 ABI.
/// Unknown architectures resolve to no tokens at all, never an error.
pub fn resolve(arch: &str, abi_version: Option<&str>) -> ArchTokens {
    match arch {
        "i386" => tokens("386", Some("linux-386")),
        "i686" => tokens("386", None),
        "x86_64" => tokens("amd64", Some("linux-amd64")),
        "mipsel" => tokens("mipsel", Some("linux-mipsle-softfloat")),
        "mips64el" => tokens("mips64el", None),
        "mips" => tokens("mips", Some("linux-mips-softfloat")),
        "mips64" => tokens("mips64", Some("linux-mips64")),
        "arm" => match abi_version {
            Some(v) => {
                let adguard = format!("arm{v}");
                let clash = format!("linux-arm{v}");
                tokens(&adguard, Some(clash.as_str()))
            }
            None => tokens("armv5", Some("linux-armv5")),
        },
        "aarch64" => tokens("arm64", Some("linux-arm64")),
        "powerpc" => tokens("powerpc", None),
        "powerpc64" => tokens("ppc64", None),
        _ => ArchTokens::default(),
    }
}
