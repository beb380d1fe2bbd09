use std::collections::HashMap;
use std::fmt::Write;
use std::path::PathBuf;
use std::{env, fs};

static CONFIGS: &[(&str, usize)] = &[
    ("IFACE_MAX_ROUTE_COUNT", 256),
    ("IFACE_MAX_COUNT", 16),
    ("DEFAULT_TTL", 64),
    ("LINK_HEADER_LEN", 14),
];

struct ConfigState {
    value: usize,
    seen_env: bool,
}

fn main() {
    // only rebuild if build.rs changed. Otherwise Cargo will rebuild if any
    // other file changed.
    println!("cargo:rerun-if-changed=build.rs");

    // Rebuild if config envvar changed.
    for (name, _) in CONFIGS {
        println!("cargo:rerun-if-env-changed=IPFORWARD_{name}");
    }

    let mut configs = HashMap::new();
    for (name, default) in CONFIGS {
        configs.insert(
            *name,
            ConfigState {
                value: *default,
                seen_env: false,
            },
        );
    }

    let prefix = "IPFORWARD_";
    for (var, value) in env::vars() {
        if let Some(name) = var.strip_prefix(prefix) {
            let Some(cfg) = configs.get_mut(name) else {
                continue;
            };
            let value = match value.parse::<usize>() {
                Ok(v) => v,
                Err(_) => panic!("Invalid value for environment variable {var}: {value}"),
            };
            if cfg.seen_env {
                panic!("multiple values set for {name}");
            }
            cfg.value = value;
            cfg.seen_env = true;
        }
    }

    if let Some(ttl) = configs.get("DEFAULT_TTL") {
        if ttl.value == 0 || ttl.value > 255 {
            panic!("DEFAULT_TTL must be in 1..=255, got {}", ttl.value);
        }
    }

    let mut data = String::new();

    for (name, _) in CONFIGS {
        let cfg = &configs[name];
        let ty = match *name {
            "DEFAULT_TTL" => "u8",
            _ => "usize",
        };
        writeln!(&mut data, "pub const {}: {} = {};", name, ty, cfg.value).unwrap();
    }

    let out_dir = PathBuf::from(env::var_os("OUT_DIR").unwrap());
    let out_file = out_dir.join("config.rs").to_string_lossy().to_string();
    fs::write(out_file, data).unwrap();
}
