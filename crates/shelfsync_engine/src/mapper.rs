//! Translation between books and remote records.
//!
//! Every remote key has one entry in a static table holding its getter and
//! setter, so adding a field is a single table entry. Setters receive `None`
//! for absent remote values and apply that key's null policy.

use shelfsync_model::{
    from_cbor, to_cbor, RecordId, RecordValue, RemoteRecord, ZoneId,
};
use shelfsync_store::{Author, Book, Predicate, ReadState, RecordKey};
use std::collections::{BTreeMap, BTreeSet};

/// Record name prefix for books from the external catalog.
pub const GOOGLE_BOOKS_PREFIX: &str = "gbid:";
/// Record name prefix for manually entered books.
pub const MANUAL_PREFIX: &str = "mid:";

struct FieldMapping {
    key: RecordKey,
    get: fn(&Book) -> Option<RecordValue>,
    set: fn(&mut Book, Option<&RecordValue>),
}

fn text(value: Option<&RecordValue>) -> Option<String> {
    value.and_then(RecordValue::as_text).map(str::to_owned)
}

fn integer<T: TryFrom<i64>>(value: Option<&RecordValue>) -> Option<T> {
    value
        .and_then(RecordValue::as_integer)
        .and_then(|v| T::try_from(v).ok())
}

fn timestamp(value: Option<&RecordValue>) -> Option<i64> {
    value.and_then(RecordValue::as_timestamp)
}

fn encode_authors(book: &Book) -> Option<RecordValue> {
    match to_cbor(&book.authors) {
        Ok(bytes) => Some(RecordValue::Bytes(bytes)),
        Err(e) => {
            tracing::error!(entity = %book.id, error = %e, "failed to encode authors");
            None
        }
    }
}

fn decode_authors(book: &mut Book, value: Option<&RecordValue>) {
    book.authors = match value.and_then(RecordValue::as_bytes) {
        None => Vec::new(),
        Some(bytes) => from_cbor::<Vec<Author>>(bytes).unwrap_or_else(|e| {
            tracing::error!(entity = %book.id, error = %e, "failed to decode authors");
            Vec::new()
        }),
    };
}

fn encode_read_dates(book: &Book) -> Option<RecordValue> {
    match book.read_state {
        ReadState::ToRead => None,
        ReadState::Reading { started } => {
            Some(RecordValue::List(vec![RecordValue::Timestamp(started)]))
        }
        ReadState::Finished { started, finished } => Some(RecordValue::List(vec![
            RecordValue::Timestamp(started),
            RecordValue::Timestamp(finished),
        ])),
    }
}

fn decode_read_dates(book: &mut Book, value: Option<&RecordValue>) {
    let dates: Vec<i64> = value
        .and_then(RecordValue::as_list)
        .map(|list| list.iter().filter_map(RecordValue::as_timestamp).collect())
        .unwrap_or_default();
    book.read_state = match dates.as_slice() {
        [started] => ReadState::Reading { started: *started },
        [started, finished] => ReadState::Finished {
            started: *started,
            finished: *finished,
        },
        _ => ReadState::ToRead,
    };
}

static FIELDS: [FieldMapping; 16] = [
    FieldMapping {
        key: RecordKey::Title,
        get: |b| Some(RecordValue::Text(b.title.clone())),
        set: |b, v| {
            if let Some(title) = text(v) {
                b.title = title;
            }
        },
    },
    FieldMapping {
        key: RecordKey::Subtitle,
        get: |b| b.subtitle.clone().map(RecordValue::Text),
        set: |b, v| b.subtitle = text(v),
    },
    FieldMapping {
        key: RecordKey::GoogleBooksId,
        get: |b| b.google_books_id.clone().map(RecordValue::Text),
        set: |b, v| b.google_books_id = text(v),
    },
    FieldMapping {
        key: RecordKey::ManualBookId,
        get: |b| b.manual_book_id.clone().map(RecordValue::Text),
        set: |b, v| b.manual_book_id = text(v),
    },
    FieldMapping {
        key: RecordKey::Isbn13,
        get: |b| b.isbn13.map(RecordValue::Integer),
        set: |b, v| b.isbn13 = integer(v),
    },
    FieldMapping {
        key: RecordKey::PageCount,
        get: |b| b.page_count.map(|n| RecordValue::Integer(n.into())),
        set: |b, v| b.page_count = integer(v),
    },
    FieldMapping {
        key: RecordKey::PublicationDate,
        get: |b| b.publication_date.map(RecordValue::Timestamp),
        set: |b, v| b.publication_date = timestamp(v),
    },
    FieldMapping {
        key: RecordKey::BookDescription,
        get: |b| b.description.clone().map(RecordValue::Text),
        set: |b, v| b.description = text(v),
    },
    FieldMapping {
        key: RecordKey::Notes,
        get: |b| b.notes.clone().map(RecordValue::Text),
        set: |b, v| b.notes = text(v),
    },
    FieldMapping {
        key: RecordKey::CurrentPage,
        get: |b| b.current_page.map(|n| RecordValue::Integer(n.into())),
        set: |b, v| b.current_page = integer(v),
    },
    FieldMapping {
        key: RecordKey::LanguageCode,
        get: |b| b.language_code.clone().map(RecordValue::Text),
        set: |b, v| {
            if let Some(code) = text(v) {
                b.language_code = Some(code);
            }
        },
    },
    FieldMapping {
        key: RecordKey::Rating,
        get: |b| b.rating.map(|n| RecordValue::Integer(n.into())),
        set: |b, v| b.rating = integer(v),
    },
    FieldMapping {
        key: RecordKey::Sort,
        get: |b| Some(RecordValue::Integer(b.sort.into())),
        set: |b, v| b.sort = integer(v).unwrap_or(0),
    },
    FieldMapping {
        key: RecordKey::ReadDates,
        get: encode_read_dates,
        set: decode_read_dates,
    },
    FieldMapping {
        key: RecordKey::Authors,
        get: encode_authors,
        set: decode_authors,
    },
    FieldMapping {
        key: RecordKey::CoverImage,
        get: |b| b.cover_image.clone().map(RecordValue::Bytes),
        set: |b, v| b.cover_image = v.and_then(RecordValue::as_bytes).map(<[u8]>::to_vec),
    },
];

fn mapping(key: RecordKey) -> &'static FieldMapping {
    // The table holds one entry per key, in `RecordKey::ALL` order.
    &FIELDS[RecordKey::ALL.iter().position(|k| *k == key).unwrap_or_default()]
}

/// Returns the value a book holds for a remote key.
pub fn field_value(book: &Book, key: RecordKey) -> Option<RecordValue> {
    (mapping(key).get)(book)
}

/// Returns every non-null remote value of a book, by key name.
pub fn fields(book: &Book) -> BTreeMap<String, RecordValue> {
    FIELDS
        .iter()
        .filter_map(|m| (m.get)(book).map(|value| (m.key.as_str().to_owned(), value)))
        .collect()
}

/// Returns the remote record name of a book.
///
/// Catalog books are named after their catalog ID, everything else after its
/// manual ID, so two books from different identity sources never collide.
pub fn record_name(book: &Book) -> Option<String> {
    match (&book.google_books_id, &book.manual_book_id) {
        (Some(gbid), _) => Some(format!("{GOOGLE_BOOKS_PREFIX}{gbid}")),
        (None, Some(mid)) => Some(format!("{MANUAL_PREFIX}{mid}")),
        (None, None) => None,
    }
}

/// Builds the record for a book, carrying only `keys`.
///
/// Returns `None` if the book has no identity to derive a record name from.
pub fn to_record(book: &Book, zone: &ZoneId, keys: &[RecordKey]) -> Option<RemoteRecord> {
    let name = book
        .remote_identifier
        .clone()
        .or_else(|| record_name(book))?;
    let mut record = RemoteRecord::new(RecordId::new(zone.clone(), name), Book::RECORD_TYPE)
        .with_system_fields(book.encoded_system_fields.clone());
    for key in keys {
        record.set(key.as_str(), field_value(book, *key));
    }
    Some(record)
}

/// Applies a downloaded record to a book, skipping `excluding`.
///
/// Also adopts the record's name and system fields. Never marks keys
/// pending.
pub fn apply(record: &RemoteRecord, book: &mut Book, excluding: &BTreeSet<RecordKey>) {
    for m in FIELDS.iter().filter(|m| !excluding.contains(&m.key)) {
        (m.set)(book, record.get(m.key.as_str()));
    }
    book.remote_identifier = Some(record.name().to_owned());
    book.encoded_system_fields = record.system_fields.clone();
}

/// Builds the predicate matching local books a new remote record may
/// belong to.
///
/// Returns `None` for record names without a known prefix.
pub fn candidate_predicate(record_name: &str) -> Option<Predicate> {
    if let Some(gbid) = record_name.strip_prefix(GOOGLE_BOOKS_PREFIX) {
        Some(Predicate::GoogleBooksIdEquals(gbid.to_owned()))
    } else if let Some(mid) = record_name.strip_prefix(MANUAL_PREFIX) {
        Some(Predicate::ManualBookIdEquals(mid.to_owned()))
    } else {
        tracing::error!(record = record_name, "unexpected format of remote record name");
        None
    }
}
