//! Connection: the caller-facing session
//!
//! Holds query options and the read-client thresholds, submits queries and
//! hands back adaptive cursors. Options apply to queries executed after they
//! are set; an open cursor keeps the settings it was created with.
//!
//! Every method of a closed connection fails with `IllegalState`, except
//! `close` itself which is then a no-op.

use bqlink_common::{BqlinkError, ReadClientConfig, Result};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};

use crate::cursor::{CursorCloser, CursorOptions, CursorRegistry, ResultCursor};
use crate::labels::Labels;
use crate::metrics;
use crate::options::{
    validate_parameters, validate_properties, ClientInfoName, ConnectionProperty, DatasetId,
    QueryParameter,
};
use crate::service::{QueryRequest, Services};

#[derive(Debug, Clone)]
struct Settings {
    timeout: Option<Duration>,
    dry_run: bool,
    use_legacy_sql: bool,
    max_results: Option<u64>,
    maximum_bytes_billed: Option<u64>,
    use_query_cache: bool,
    default_dataset: Option<DatasetId>,
    connection_properties: Vec<ConnectionProperty>,
    labels: Labels,
    client_info: BTreeMap<ClientInfoName, String>,
    query_parameters: Vec<QueryParameter>,
    strict_ordering: bool,
    read_client: ReadClientConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            timeout: None,
            dry_run: false,
            use_legacy_sql: false,
            max_results: None,
            maximum_bytes_billed: None,
            use_query_cache: true,
            default_dataset: None,
            connection_properties: Vec::new(),
            labels: Labels::new(),
            client_info: BTreeMap::new(),
            query_parameters: Vec::new(),
            strict_ordering: false,
            read_client: ReadClientConfig::default(),
        }
    }
}

pub struct Connection {
    services: Services,
    settings: Settings,
    closed: AtomicBool,
    cursors: Arc<CursorRegistry>,
}

impl Connection {
    /// Connection with default read-client thresholds
    pub fn new(services: Services) -> Self {
        Self::with_read_client_config(services, ReadClientConfig::default())
    }

    pub fn with_read_client_config(services: Services, read_client: ReadClientConfig) -> Self {
        Self {
            services,
            settings: Settings {
                read_client,
                ..Settings::default()
            },
            closed: AtomicBool::new(false),
            cursors: Arc::new(CursorRegistry::new()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Cursors created by this connection and not yet finished
    pub fn active_cursors(&self) -> usize {
        self.cursors.len()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(BqlinkError::IllegalState("connection is closed".into()));
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // QUERY OPTIONS
    // ═══════════════════════════════════════════════════════════════════════

    /// Synchronous response timeout for query submission; `None` waits
    /// indefinitely
    pub fn timeout(&self) -> Result<Option<Duration>> {
        self.ensure_open()?;
        Ok(self.settings.timeout)
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.ensure_open()?;
        if timeout == Some(Duration::ZERO) {
            return Err(BqlinkError::Validation("timeout must be positive".into()));
        }
        self.settings.timeout = timeout;
        Ok(())
    }

    pub fn dry_run(&self) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.settings.dry_run)
    }

    pub fn set_dry_run(&mut self, dry_run: bool) -> Result<()> {
        self.ensure_open()?;
        self.settings.dry_run = dry_run;
        Ok(())
    }

    pub fn use_legacy_sql(&self) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.settings.use_legacy_sql)
    }

    pub fn set_use_legacy_sql(&mut self, use_legacy_sql: bool) -> Result<()> {
        self.ensure_open()?;
        self.settings.use_legacy_sql = use_legacy_sql;
        Ok(())
    }

    pub fn max_results(&self) -> Result<Option<u64>> {
        self.ensure_open()?;
        Ok(self.settings.max_results)
    }

    /// Cap on rows delivered per cursor. Reaching it ends the cursor as if
    /// the result were exhausted.
    pub fn set_max_results(&mut self, max_results: Option<u64>) -> Result<()> {
        self.ensure_open()?;
        if max_results == Some(0) {
            return Err(BqlinkError::Validation("max results must be positive".into()));
        }
        self.settings.max_results = max_results;
        Ok(())
    }

    pub fn maximum_bytes_billed(&self) -> Result<Option<u64>> {
        self.ensure_open()?;
        Ok(self.settings.maximum_bytes_billed)
    }

    pub fn set_maximum_bytes_billed(&mut self, bytes: Option<u64>) -> Result<()> {
        self.ensure_open()?;
        if bytes == Some(0) {
            return Err(BqlinkError::Validation(
                "maximum bytes billed must be positive".into(),
            ));
        }
        self.settings.maximum_bytes_billed = bytes;
        Ok(())
    }

    pub fn use_query_cache(&self) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.settings.use_query_cache)
    }

    pub fn set_use_query_cache(&mut self, use_query_cache: bool) -> Result<()> {
        self.ensure_open()?;
        self.settings.use_query_cache = use_query_cache;
        Ok(())
    }

    pub fn default_dataset(&self) -> Result<Option<DatasetId>> {
        self.ensure_open()?;
        Ok(self.settings.default_dataset.clone())
    }

    pub fn set_default_dataset(&mut self, dataset: Option<DatasetId>) -> Result<()> {
        self.ensure_open()?;
        self.settings.default_dataset = dataset;
        Ok(())
    }

    pub fn connection_properties(&self) -> Result<Vec<ConnectionProperty>> {
        self.ensure_open()?;
        Ok(self.settings.connection_properties.clone())
    }

    /// Replace the property list; order is kept as given
    pub fn set_connection_properties(&mut self, properties: Vec<ConnectionProperty>) -> Result<()> {
        self.ensure_open()?;
        validate_properties(&properties)?;
        self.settings.connection_properties = properties;
        Ok(())
    }

    pub fn labels(&self) -> Result<Labels> {
        self.ensure_open()?;
        Ok(self.settings.labels.clone())
    }

    /// Replace all labels. On a validation failure the old labels stay.
    pub fn set_labels(&mut self, labels: HashMap<String, String>) -> Result<()> {
        self.ensure_open()?;
        self.settings.labels = Labels::try_from_map(labels)?;
        Ok(())
    }

    pub fn set_label(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        self.ensure_open()?;
        self.settings.labels.insert(key, value)
    }

    pub fn clear_labels(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.settings.labels.clear();
        Ok(())
    }

    pub fn query_parameters(&self) -> Result<Vec<QueryParameter>> {
        self.ensure_open()?;
        Ok(self.settings.query_parameters.clone())
    }

    /// Parameters bound to subsequent queries; checked when a query runs
    pub fn set_query_parameters(&mut self, parameters: Vec<QueryParameter>) -> Result<()> {
        self.ensure_open()?;
        self.settings.query_parameters = parameters;
        Ok(())
    }

    pub fn strict_ordering(&self) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.settings.strict_ordering)
    }

    /// Require rows in result order; streaming reads use a single partition
    pub fn set_strict_ordering(&mut self, strict_ordering: bool) -> Result<()> {
        self.ensure_open()?;
        self.settings.strict_ordering = strict_ordering;
        Ok(())
    }

    pub fn read_client_config(&self) -> Result<ReadClientConfig> {
        self.ensure_open()?;
        Ok(self.settings.read_client)
    }

    pub fn set_read_client_config(&mut self, config: ReadClientConfig) -> Result<()> {
        self.ensure_open()?;
        self.settings.read_client = config;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // CLIENT INFO
    // ═══════════════════════════════════════════════════════════════════════

    pub fn client_info(&self, name: &str) -> Result<Option<String>> {
        self.ensure_open()?;
        let name = ClientInfoName::parse(name)?;
        Ok(self.settings.client_info.get(&name).cloned())
    }

    pub fn client_infos(&self) -> Result<BTreeMap<String, String>> {
        self.ensure_open()?;
        Ok(self
            .settings
            .client_info
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect())
    }

    /// Set a client info property after the client-info service accepts it.
    /// `None` or an empty value clears the property.
    pub async fn set_client_info(&mut self, name: &str, value: Option<&str>) -> Result<()> {
        if self.is_closed() {
            return Err(BqlinkError::ClientInfo {
                name: name.to_string(),
                reason: "connection is closed".into(),
            });
        }
        let key = ClientInfoName::parse(name)?;
        let value = value.filter(|v| !v.is_empty());

        if let Err(err) = self
            .services
            .client_info
            .set_property(key.as_str(), value)
            .await
        {
            warn!(name = %key, code = %err.code, error = %err.message, "Client info rejected");
            return Err(BqlinkError::ClientInfo {
                name: key.to_string(),
                reason: err.to_string(),
            });
        }

        match value {
            Some(value) => {
                self.settings.client_info.insert(key, value.to_string());
            }
            None => {
                self.settings.client_info.remove(&key);
            }
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // EXECUTION
    // ═══════════════════════════════════════════════════════════════════════

    fn build_request(&self, sql: &str) -> QueryRequest {
        let settings = &self.settings;
        QueryRequest {
            dry_run: settings.dry_run,
            use_legacy_sql: settings.use_legacy_sql,
            use_query_cache: settings.use_query_cache,
            maximum_bytes_billed: settings.maximum_bytes_billed,
            max_results: settings.max_results,
            default_dataset: settings.default_dataset.clone(),
            parameters: settings.query_parameters.clone(),
            labels: settings.labels.to_map(),
            connection_properties: settings.connection_properties.clone(),
            ..QueryRequest::new(sql)
        }
    }

    /// Submit `sql` and return a cursor over its result. Nothing is
    /// submitted when validation fails, and no cursor exists when the
    /// submission does.
    #[instrument(skip(self, sql), fields(sql_len = sql.len()))]
    pub async fn execute_select(&self, sql: &str) -> Result<ResultCursor> {
        self.ensure_open()?;
        if sql.trim().is_empty() {
            return Err(BqlinkError::Validation("query must not be empty".into()));
        }
        validate_parameters(&self.settings.query_parameters)?;

        let request = self.build_request(sql);
        info!(
            request_id = %request.request_id,
            dry_run = request.dry_run,
            labels = request.labels.len(),
            parameters = request.parameters.len(),
            "Submitting query"
        );

        let started = Instant::now();
        let submission = self.services.submitter.submit(&request);
        let outcome = match self.settings.timeout {
            Some(limit) => match tokio::time::timeout(limit, submission).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    metrics::record_submission("timeout", started.elapsed().as_secs_f64());
                    warn!(request_id = %request.request_id, timeout = ?limit, "Query submission timed out");
                    return Err(BqlinkError::Timeout(limit));
                }
            },
            None => submission.await,
        };

        let metadata = match outcome {
            Ok(metadata) => metadata,
            Err(err) => {
                metrics::record_submission("error", started.elapsed().as_secs_f64());
                warn!(
                    request_id = %request.request_id,
                    code = %err.code,
                    error = %err.message,
                    "Query submission failed"
                );
                return Err(BqlinkError::BigQuery(err));
            }
        };
        metrics::record_submission("ok", started.elapsed().as_secs_f64());
        info!(
            request_id = %request.request_id,
            job = %metadata.job_id,
            cache_hit = metadata.cache_hit,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Query completed"
        );

        let options = CursorOptions {
            max_rows: self.settings.max_results,
            strict_ordering: self.settings.strict_ordering,
        };
        let cursor = ResultCursor::open(
            metadata,
            &self.settings.read_client,
            &self.services,
            options,
            Some(Arc::downgrade(&self.cursors)),
        );
        self.cursors.insert(cursor.id(), cursor.closer());

        // Closed while the query was running
        if self.is_closed() {
            cursor.close().await;
            return Err(BqlinkError::IllegalState("connection is closed".into()));
        }
        Ok(cursor)
    }

    /// Close every open cursor and refuse further use. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let closers: Vec<CursorCloser> = self
            .cursors
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        info!(cursors = closers.len(), "Closing connection");
        for closer in closers {
            closer.close().await;
        }
        self.cursors.clear();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("closed", &self.is_closed())
            .field("active_cursors", &self.cursors.len())
            .field("settings", &self.settings)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryWarehouse, ResultFixture};
    use crate::options::ParameterValue;

    fn connection(warehouse: InMemoryWarehouse) -> (Arc<InMemoryWarehouse>, Connection) {
        let warehouse = Arc::new(warehouse);
        let connection = Connection::new(Services::from_backend(warehouse.clone()));
        (warehouse, connection)
    }

    #[test]
    fn test_defaults() {
        let (_, conn) = connection(InMemoryWarehouse::new());
        assert_eq!(conn.timeout().unwrap(), None);
        assert!(conn.use_query_cache().unwrap());
        assert!(!conn.dry_run().unwrap());
        assert!(conn.labels().unwrap().is_empty());
        assert_eq!(conn.read_client_config().unwrap(), ReadClientConfig::default());
    }

    #[test]
    fn test_setters_validate() {
        let (_, mut conn) = connection(InMemoryWarehouse::new());
        assert!(conn.set_timeout(Some(Duration::ZERO)).is_err());
        assert!(conn.set_max_results(Some(0)).is_err());
        assert!(conn.set_maximum_bytes_billed(Some(0)).is_err());
        assert!(conn.set_label("Team", "x").is_err());

        conn.set_label("team", "analytics").unwrap();
        let mut bad = HashMap::new();
        bad.insert("ok".to_string(), "v".to_string());
        bad.insert("".to_string(), "v".to_string());
        assert!(conn.set_labels(bad).is_err());
        assert_eq!(conn.labels().unwrap().get("team"), Some("analytics"));

        conn.clear_labels().unwrap();
        conn.clear_labels().unwrap();
        assert!(conn.labels().unwrap().is_empty());

        let duplicate = vec![
            ConnectionProperty::new("time_zone", "UTC").unwrap(),
            ConnectionProperty::new("time_zone", "Europe/Paris").unwrap(),
        ];
        assert!(conn.set_connection_properties(duplicate).is_err());
    }

    #[tokio::test]
    async fn test_closed_connection_rejects_everything() {
        let (_, mut conn) = connection(InMemoryWarehouse::new());
        conn.close().await;
        conn.close().await;

        assert!(matches!(conn.dry_run(), Err(BqlinkError::IllegalState(_))));
        assert!(matches!(conn.set_dry_run(true), Err(BqlinkError::IllegalState(_))));
        assert!(matches!(conn.clear_labels(), Err(BqlinkError::IllegalState(_))));
        assert!(matches!(
            conn.execute_select("SELECT 1").await,
            Err(BqlinkError::IllegalState(_))
        ));
        assert!(matches!(
            conn.set_client_info("ApplicationName", Some("bi")).await,
            Err(BqlinkError::ClientInfo { .. })
        ));
    }

    #[tokio::test]
    async fn test_client_info_round_trip() {
        let (warehouse, mut conn) =
            connection(InMemoryWarehouse::new().reject_client_info("Tenant"));

        conn.set_client_info("ApplicationName", Some("dashboards"))
            .await
            .unwrap();
        assert_eq!(
            conn.client_info("ApplicationName").unwrap().as_deref(),
            Some("dashboards")
        );
        assert_eq!(
            warehouse.client_info("ApplicationName").as_deref(),
            Some("dashboards")
        );

        conn.set_client_info("ApplicationName", Some("")).await.unwrap();
        assert_eq!(conn.client_info("ApplicationName").unwrap(), None);

        let err = conn.set_client_info("Tenant", Some("a")).await.unwrap_err();
        assert_eq!(err.code(), "CLIENT_INFO_ERROR");
        assert_eq!(conn.client_info("Tenant").unwrap(), None);
        assert_eq!(conn.client_info("ClientUser").unwrap(), None);
    }

    #[tokio::test]
    async fn test_validation_happens_before_submission() {
        let (warehouse, mut conn) = connection(InMemoryWarehouse::new());
        assert!(matches!(
            conn.execute_select("   ").await,
            Err(BqlinkError::Validation(_))
        ));

        conn.set_query_parameters(vec![
            QueryParameter::named("a", ParameterValue::Int64(1)),
            QueryParameter::positional(ParameterValue::Bool(true)),
        ])
        .unwrap();
        assert!(matches!(
            conn.execute_select("SELECT @a").await,
            Err(BqlinkError::Validation(_))
        ));
        assert_eq!(warehouse.submissions(), 0);
    }

    #[tokio::test]
    async fn test_submission_failure_is_wrapped() {
        let (_, conn) = connection(InMemoryWarehouse::new());
        let err = conn.execute_select("SELECT missing").await.unwrap_err();
        match err {
            BqlinkError::BigQuery(service) => assert_eq!(service.code, "NOT_FOUND"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(conn.active_cursors(), 0);
    }

    #[tokio::test]
    async fn test_settings_do_not_touch_open_cursor() {
        let (warehouse, mut conn) = connection(InMemoryWarehouse::new().with_first_page_rows(5));
        warehouse.register("SELECT n", ResultFixture::sequence("n", 30));
        conn.set_max_results(Some(12)).unwrap();

        let mut cursor = conn.execute_select("SELECT n").await.unwrap();
        conn.set_max_results(Some(1)).unwrap();

        let mut rows = 0;
        while cursor.next().await.unwrap().is_some() {
            rows += 1;
        }
        assert_eq!(rows, 12);
        assert_eq!(conn.active_cursors(), 0);
    }
}
