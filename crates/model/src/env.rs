/// Environment variable containing the record table name
pub const TABLE_NAME: &'static str = "TABLE_NAME";
/// Environment variable containing the provisioning queue URL
pub const QUEUE_URL: &'static str = "QUEUE_URL";
