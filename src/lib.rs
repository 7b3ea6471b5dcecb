// src/lib.rs

pub mod config;

pub mod entities {
    pub mod price_table;
}

pub mod models {
    pub mod price;
}

pub mod services {
    pub mod growth;
    pub mod ingestion;
    pub mod price_source;
    pub mod schema_manager;
    pub mod store_writer;
    pub mod table_locks;
    pub mod yahoo_finance;
}
