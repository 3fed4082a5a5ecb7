//! Default TOML config template with inline documentation comments.

/// Generate the default TOML config content with comments.
pub(crate) fn default_config_toml() -> String {
    r##"# nearby configuration
# Schema version 1
# Only override what you want to change -- missing fields use defaults.

[backend]
# project_ref = ""          # <ref>.supabase.co
# api_key = ""              # prefer NEARBY_SUPABASE_KEY
# rest_url = "http://localhost:54321/rest/v1"

[realtime]
# heartbeat_interval_secs = 25    # 5-120
# heartbeat_timeout_secs = 60     # must exceed the heartbeat interval
# reconnect_delay_secs = 1
# max_reconnect_delay_secs = 30
# join_timeout_secs = 10          # 1-60

[presence]
# enabled = true
# topic = "presence:neighborhood"
# heartbeat_interval_secs = 30    # 5-300

[status]
# table = "user_status"
# default_ttl_mins = 60           # 1-max_ttl_mins
# max_ttl_mins = 480              # 1-1440
# share_location = true
# latitude = 40.4168
# longitude = -3.7038

[notifications]
# table = "notifications"
# profiles_table = "profiles"
# order = "asc"                   # asc | desc

[logging]
# level = "INFO"                  # DEBUG | INFO | WARNING | ERROR
"##
    .to_string()
}
