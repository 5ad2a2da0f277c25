//! Default `docflow.toml` written by `docflow init`.

pub const CONFIG_FILE: &str = "docflow.toml";

pub const DEFAULT_CONFIG: &str = r#"# docflow configuration
#
# Every key is optional; missing keys keep their built-in defaults.
# The generation API key is never stored here: set DOCFLOW_API_KEY.

# Per-attempt timeout of one pipeline stage.
stage_timeout_ms = 180000
# Outer timeout of a whole run. Expiry cancels the run.
run_timeout_ms = 900000
max_concurrent_runs = 4
max_sandbox_workers = 2
max_document_bytes = 52428800
# How often a failing generated script is sent back for repair.
repair_attempts = 1
report_prefix = "Financial_Report"
report_extension = "xlsx"

[retry]
max_attempts = 3
initial_backoff_ms = 1000
max_backoff_ms = 60000
multiplier = 2.0

# Finished runs stay queryable until either limit pushes them out.
# Live runs are never dropped.
[retention]
max_finished_runs = 100
finished_ttl_secs = 3600

[generation]
base_url = "https://openrouter.ai/api/v1"
coordinator_model = "google/gemini-2.5-pro"
prompt_engineer_model = "google/gemini-2.5-pro"
extractor_model = "google/gemini-2.5-pro"
arranger_model = "google/gemini-2.5-pro"
code_generator_model = "google/gemini-2.5-flash"
request_timeout_ms = 120000
temperature = 0.1

[limits]
cpu_time_secs = 60
wall_time_ms = 120000
memory_bytes = 536870912
max_output_bytes = 262144
max_file_bytes = 67108864
network = "deny"
# "scoped_temp_dir" jails the script in its working directory. "host"
# (with network = "allow") runs it unconfined, for trusted scripts only.
filesystem = "scoped_temp_dir"

[sandbox]
python = "python3"
# Confined runs need a namespace jail built with `unshare`. "auto"
# refuses confined runs when no jail can be built, "required" refuses
# to start at all.
isolation = "auto"
collect_cap_bytes = 16777216
stale_after_secs = 86400

# Extracted values are arranged into these categories. Field names and
# aliases are matched case- and punctuation-insensitively.

[[taxonomy.categories]]
name = "company_profile"
fields = [
  { name = "company_name", kind = "text", aliases = ["issuer", "registrant"] },
  { name = "fiscal_year", kind = "date", aliases = ["reporting_period", "fy"] },
  { name = "reporting_currency", kind = "text", required = false },
]

[[taxonomy.categories]]
name = "income_statement"
fields = [
  { name = "revenue", kind = "currency", aliases = ["total revenue", "sales", "net sales", "turnover"] },
  { name = "cost_of_revenue", kind = "currency", aliases = ["cost of sales", "cogs"] },
  { name = "gross_profit", kind = "currency" },
  { name = "operating_income", kind = "currency", aliases = ["ebit", "operating profit"] },
  { name = "net_income", kind = "currency", aliases = ["net profit", "net earnings"] },
]

[[taxonomy.categories]]
name = "balance_sheet"
fields = [
  { name = "total_assets", kind = "currency", aliases = ["assets"] },
  { name = "total_liabilities", kind = "currency", aliases = ["liabilities"] },
  { name = "shareholders_equity", kind = "currency", aliases = ["total equity", "stockholders equity"] },
  { name = "cash_and_equivalents", kind = "currency", aliases = ["cash"] },
]

[[taxonomy.categories]]
name = "cash_flow"
fields = [
  { name = "operating_cash_flow", kind = "currency", aliases = ["cash from operations"] },
  { name = "capital_expenditure", kind = "currency", aliases = ["capex"] },
  { name = "free_cash_flow", kind = "currency", required = false, aliases = ["fcf"] },
]

[[taxonomy.categories]]
name = "profitability"
fields = [
  { name = "gross_margin", kind = "percentage" },
  { name = "operating_margin", kind = "percentage", aliases = ["ebit margin"] },
  { name = "net_margin", kind = "percentage", aliases = ["profit margin"] },
  { name = "return_on_equity", kind = "percentage", aliases = ["roe"], required = false },
]

[[taxonomy.categories]]
name = "liquidity"
fields = [
  { name = "current_ratio", kind = "number" },
  { name = "quick_ratio", kind = "number", aliases = ["acid test"], required = false },
  { name = "working_capital", kind = "currency", required = false },
]

[[taxonomy.categories]]
name = "leverage"
fields = [
  { name = "total_debt", kind = "currency", aliases = ["debt", "borrowings"] },
  { name = "debt_to_equity", kind = "number", aliases = ["gearing"] },
  { name = "interest_coverage", kind = "number", required = false },
]

[[taxonomy.categories]]
name = "efficiency"
fields = [
  { name = "asset_turnover", kind = "number", required = false },
  { name = "inventory_turnover", kind = "number", required = false },
  { name = "days_sales_outstanding", kind = "number", aliases = ["dso"], required = false },
]

[[taxonomy.categories]]
name = "per_share"
fields = [
  { name = "earnings_per_share", kind = "currency", aliases = ["eps", "diluted eps"] },
  { name = "dividend_per_share", kind = "currency", aliases = ["dps"], required = false },
  { name = "shares_outstanding", kind = "number", required = false },
]

[[taxonomy.categories]]
name = "growth"
fields = [
  { name = "revenue_growth", kind = "percentage", aliases = ["sales growth"] },
  { name = "earnings_growth", kind = "percentage", required = false },
]

[[taxonomy.categories]]
name = "segments"
fields = [
  { name = "segment_revenue", kind = "currency", required = false },
  { name = "geographic_revenue", kind = "currency", aliases = ["revenue by region"], required = false },
]

[[taxonomy.categories]]
name = "outlook"
fields = [
  { name = "revenue_guidance", kind = "currency", aliases = ["guidance"], required = false },
  { name = "headcount", kind = "number", aliases = ["employees"], required = false },
]

[[taxonomy.categories]]
name = "risk"
fields = [
  { name = "key_risks", kind = "text", aliases = ["risk factors"], required = false },
  { name = "auditor_opinion", kind = "text", required = false },
]
"#;
