pub fn setup_logs() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

/// Replica identity used for the leader lock: stable enough to read in
/// logs, unique enough that two replicas on one host never collide.
pub fn replica_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "ingester".to_string());
    format!("{host}-{:08x}", rand::random::<u32>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replica_ids_are_unique_per_process() {
        assert_ne!(replica_id(), replica_id());
    }
}
