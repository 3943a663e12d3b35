/// Node settings assembled from the CLI.
#[derive(Debug, Clone)]
pub struct Config {
    pub rpc_url: String,
    pub auth_token: String,
    pub validator_address: String,
    pub data_dir: String,
    pub status_port: u16,
    pub fetch_interval_secs: u64,
    pub decision_interval_secs: u64,
    pub status_interval_secs: u64,
    pub block_poll_secs: u64,
}
