pub mod v1 {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};

    use fise::element::{CapacityEntry, Mode, RetentionPolicy};

    pub const UPLOAD_PATH: &str = "/api/v1/files/upload";
    // one param name for both: the router rejects same-position params
    // with different names
    pub const FINALIZE_PATH: &str = "/api/v1/finalize/{id}";
    pub const FINALIZE_STATUS_PATH: &str = "/api/v1/finalize/{id}/status";
    pub const ELEMENTS_PATH: &str = "/api/v1/storage-elements";

    /// Body of a 201 from the upload endpoint.
    #[derive(Debug, Serialize, Deserialize)]
    pub struct UploadResponse {
        pub file_id: String,
        pub original_filename: String,
        pub storage_filename: String,
        pub file_size: u64,
        pub checksum: String,
        pub uploaded_at: DateTime<Utc>,
        pub storage_element_url: String,
        pub retention_policy: RetentionPolicy,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub ttl_expires_at: Option<DateTime<Utc>>,
        pub storage_element_id: String,
    }

    /// Optional body of POST /api/v1/finalize/{file_id}.
    #[derive(Debug, Default, Deserialize)]
    pub struct FinalizeRequest {
        pub target_storage_element_id: Option<String>,
        pub description: Option<String>,
        pub metadata: Option<serde_json::Value>,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct FinalizeStatus {
        pub transaction_id: String,
        pub file_id: String,
        pub state: String,
        pub progress_percent: u8,
        pub created_at: DateTime<Utc>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub completed_at: Option<DateTime<Utc>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub error: Option<String>,
    }

    impl From<&ficore::finalize::FinalizeTransaction> for FinalizeStatus {
        fn from(txn: &ficore::finalize::FinalizeTransaction) -> Self {
            FinalizeStatus {
                transaction_id: txn.transaction_id.clone(),
                file_id: txn.file_id.clone(),
                state: txn.state.as_str().to_string(),
                progress_percent: txn.state.progress_percent(),
                created_at: txn.created_at,
                completed_at: txn.completed_at,
                error: txn.error.clone(),
            }
        }
    }

    /// Operator-facing view of the element map this replica selects from.
    #[derive(Debug, Serialize)]
    pub struct ElementView {
        pub element_id: String,
        pub endpoint: String,
        pub priority: i64,
        pub mode: Mode,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub capacity: Option<CapacityEntry>,
    }

    #[derive(Debug, Serialize)]
    pub struct ElementsResponse {
        pub elements: Vec<ElementView>,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct ErrorBody {
        pub error: String,
    }

    #[derive(Debug, Clone, Serialize)]
    pub struct ReadyChecks {
        pub registry: bool,
        pub admin: bool,
        pub writable_element: bool,
    }

}
