use std::path::{Path, PathBuf};

/// Snapshot of the bibliographic metadata inside an EPUB.
///
/// Produced once per extraction and never mutated afterwards. Fields that
/// are missing or blank in the package document are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EpubMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub publisher: Option<String>,
    pub language: Option<String>,
    pub identifier: Option<String>,
    pub description: Option<String>,
    pub cover: Option<Cover>,
}

/// Raw cover image bytes plus the extension of the file they came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cover {
    pub data: Vec<u8>,
    /// Lowercase file extension without the dot (e.g. "jpg").
    pub extension: String,
}

/// A Dublin Core field that can be read and edited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Title,
    Author,
    Publisher,
    Language,
    Identifier,
    Description,
}

impl Field {
    pub const ALL: [Field; 6] = [
        Field::Title,
        Field::Author,
        Field::Publisher,
        Field::Language,
        Field::Identifier,
        Field::Description,
    ];

    /// Local name of the element carrying this field in the package document.
    pub fn local_name(self) -> &'static str {
        match self {
            Field::Title => "title",
            Field::Author => "creator",
            Field::Publisher => "publisher",
            Field::Language => "language",
            Field::Identifier => "identifier",
            Field::Description => "description",
        }
    }
}

impl EpubMetadata {
    pub fn get(&self, field: Field) -> Option<&str> {
        match field {
            Field::Title => self.title.as_deref(),
            Field::Author => self.author.as_deref(),
            Field::Publisher => self.publisher.as_deref(),
            Field::Language => self.language.as_deref(),
            Field::Identifier => self.identifier.as_deref(),
            Field::Description => self.description.as_deref(),
        }
    }

    pub(crate) fn slot_mut(&mut self, field: Field) -> &mut Option<String> {
        match field {
            Field::Title => &mut self.title,
            Field::Author => &mut self.author,
            Field::Publisher => &mut self.publisher,
            Field::Language => &mut self.language,
            Field::Identifier => &mut self.identifier,
            Field::Description => &mut self.description,
        }
    }
}

/// Requested changes to a publication.
///
/// A `None` field is left untouched. A request with no field and no cover
/// is rejected with [`Error::NoChanges`](crate::Error::NoChanges).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EditRequest {
    pub title: Option<String>,
    pub author: Option<String>,
    pub publisher: Option<String>,
    pub language: Option<String>,
    pub identifier: Option<String>,
    pub description: Option<String>,
    /// Image file to install as the new cover.
    pub cover: Option<PathBuf>,
}

impl EditRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn with_publisher(mut self, publisher: impl Into<String>) -> Self {
        self.publisher = Some(publisher.into());
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_cover(mut self, path: impl AsRef<Path>) -> Self {
        self.cover = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn get(&self, field: Field) -> Option<&str> {
        match field {
            Field::Title => self.title.as_deref(),
            Field::Author => self.author.as_deref(),
            Field::Publisher => self.publisher.as_deref(),
            Field::Language => self.language.as_deref(),
            Field::Identifier => self.identifier.as_deref(),
            Field::Description => self.description.as_deref(),
        }
    }

    /// Fields with a replacement value, in canonical order.
    pub fn fields(&self) -> impl Iterator<Item = (Field, &str)> {
        Field::ALL
            .into_iter()
            .filter_map(|field| self.get(field).map(|value| (field, value)))
    }

    pub fn is_empty(&self) -> bool {
        self.fields().next().is_none() && self.cover.is_none()
    }
}
