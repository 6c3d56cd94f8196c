//! Table storage: row selection and write application

use serde_json::Value;
use tandem_types::remote_adapter::{ChangeEvent, QueryFilter, QueryOptions};
use tandem_types::types::{Row, now};
use tandem_types::utils::{random_id, row_key};

use crate::AdapterConfig;
use crate::error::Error;

pub type Table = Vec<Row>;

/// Select rows matching `opts`: filter, then sort, then limit
pub fn select(table: &Table, opts: &QueryOptions) -> Vec<Row> {
	let mut rows: Vec<Row> = table.iter().filter(|row| opts.filter.matches(row)).cloned().collect();
	if !opts.sort.is_empty() {
		rows.sort_by(|a, b| {
			opts.sort
				.iter()
				.map(|field| field.compare(a, b))
				.find(|ord| ord.is_ne())
				.unwrap_or(std::cmp::Ordering::Equal)
		});
	}
	if let Some(limit) = opts.limit {
		rows.truncate(limit as usize);
	}
	rows
}

/// Insert a row, filling in id and creation time when absent
pub fn insert(table: &mut Table, mut row: Row, config: &AdapterConfig) -> Result<ChangeEvent, Error> {
	let Some(fields) = row.as_object_mut() else {
		return Err(Error::InvalidPayload("row must be an object".into()));
	};
	if !fields.get(&config.id_field).is_some_and(|id| !id.is_null()) {
		fields.insert(config.id_field.clone(), Value::String(random_id()));
	}
	if !fields.contains_key(&config.created_at_field) {
		fields.insert(config.created_at_field.clone(), Value::from(now().as_millis()));
	}

	let key = row_key(&row, &config.id_field)
		.ok_or_else(|| Error::InvalidPayload(format!("{} must be a string or number", config.id_field)))?;
	if table.iter().any(|existing| row_key(existing, &config.id_field).as_deref() == Some(key.as_str())) {
		return Err(Error::DuplicateKey(key));
	}

	table.push(row.clone());
	Ok(ChangeEvent::insert(row))
}

/// Merge `patch` into every row matching `filter`
pub fn update(table: &mut Table, filter: &QueryFilter, patch: &Value) -> Result<Vec<ChangeEvent>, Error> {
	let Some(patch) = patch.as_object() else {
		return Err(Error::InvalidPayload("update payload must be an object".into()));
	};

	let mut events = Vec::new();
	for row in table.iter_mut().filter(|row| filter.matches(row)) {
		if let Some(fields) = row.as_object_mut() {
			for (field, value) in patch {
				fields.insert(field.clone(), value.clone());
			}
		}
		events.push(ChangeEvent::update(row.clone()));
	}
	Ok(events)
}

/// Remove every row matching `filter`
pub fn delete(table: &mut Table, filter: &QueryFilter) -> Vec<ChangeEvent> {
	let mut events = Vec::new();
	table.retain(|row| {
		if filter.matches(row) {
			events.push(ChangeEvent::delete(row.clone()));
			false
		} else {
			true
		}
	});
	events
}


// vim: ts=4
