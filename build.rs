use std::fs;
use std::path::{Path, PathBuf};

/// Tokens that would let counters capture identifying or secret data.
const FORBIDDEN: &[(&str, &str)] = &[
    ("std::net", "network addresses"),
    ("SocketAddr", "network addresses"),
    ("Ipv4Addr", "network addresses"),
    ("IpAddr", "network addresses"),
    ("socket2", "network addresses"),
    ("seq_number", "TCP sequence numbers"),
    ("ack_number", "TCP sequence numbers"),
    ("SystemTime", "timings"),
    ("Instant", "timings"),
    ("master_secret", "key material"),
    ("premaster", "key material"),
    ("KeyMaterial", "key material"),
    ("log!(", "output"),
    ("println!(", "output"),
    ("eprintln!(", "output"),
];

fn main() {
    let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") else {
        panic!("CARGO_MANIFEST_DIR is not set");
    };
    let guarded = Path::new(&manifest_dir).join("src/core/observability");
    println!("cargo:rerun-if-changed={}", guarded.display());

    let mut violations = Vec::new();
    for path in rust_sources(&guarded) {
        let contents = fs::read_to_string(&path).unwrap_or_else(|e| panic!("cannot read {}: {}", path.display(), e));
        for (token, reason) in FORBIDDEN {
            if contents.contains(token) {
                violations.push(format!("{}: `{}` ({})", path.display(), token, reason));
            }
        }
    }
    if !violations.is_empty() {
        panic!("observability module must stay free of identifying data:\n{}", violations.join("\n"));
    }
}

fn rust_sources(root: &Path) -> Vec<PathBuf> {
    let mut pending = vec![root.to_path_buf()];
    let mut sources = Vec::new();
    while let Some(dir) = pending.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for path in entries.flatten().map(|entry| entry.path()) {
            if path.is_dir() {
                pending.push(path);
            } else if path.extension().is_some_and(|ext| ext == "rs") {
                sources.push(path);
            }
        }
    }
    sources
}
