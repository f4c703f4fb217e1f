pub mod ingest_cursor;
