use std::fmt::Debug;

use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;

use super::{Entity, EntityUpdate, SqlTime, SqlValue};
use crate::store::StoreError;

/// A user-defined grouping of feeds. Purely presentational.
///
/// Disabled categories are effectively deleted but the rows stay behind so
/// clients holding a reference are not inconvenienced; disabling renames the
/// category to its stringified id, which is not a legal name, so the old
/// name is immediately reusable.
#[derive(Serialize, FromRow, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    id: i64,
    pub disabled: bool,
    /// Short lowercase name, `^[a-z][a-z0-9-]+$`.
    pub name: String,
    pub title: String,
    /// Hidden in the navigation list unless explicitly requested.
    pub hidden_nav: bool,
    /// Excluded from unread counts and the default listing. Implied by
    /// `hidden_nav`.
    pub hidden_main: bool,
    /// Categories without a sort position sort after those with one, by id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort_position: Option<i64>,
    #[serde(serialize_with = "SqlTime::unix_seconds")]
    pub commit_timestamp: SqlTime,
}

impl Entity for Category {
    const TABLE: &'static str = "categories";
    const SELECT: &'static str = "SELECT categories.* FROM categories";

    fn id(&self) -> i64 {
        self.id
    }
}

const CATEGORY_UPDATE_SQL: &str = "\
UPDATE categories SET
    disabled = ?,
    name = ?,
    title = ?,
    hidden_nav = ?,
    hidden_main = ?,
    sort_position = ?,
    commit_timestamp = CURRENT_TIMESTAMP
WHERE id = ?";

impl Category {
    fn update(&self) -> EntityUpdate {
        EntityUpdate::write(
            Self::TABLE,
            CATEGORY_UPDATE_SQL,
            vec![
                SqlValue::Bool(self.disabled),
                SqlValue::Text(self.name.clone()),
                SqlValue::Text(self.title.clone()),
                SqlValue::Bool(self.hidden_nav),
                SqlValue::Bool(self.hidden_main),
                SqlValue::opt_int(self.sort_position),
                SqlValue::Int(self.id),
            ],
        )
    }
}

/// Request body for creating a category.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CategoryAdd {
    pub name: String,
    pub title: String,
    #[serde(default)]
    pub hidden_nav: bool,
    #[serde(default)]
    pub hidden_main: bool,
}

impl CategoryAdd {
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.title.is_empty() {
            return Err(StoreError::Invalid("category title cannot be empty".into()));
        }
        validate_name(&self.name)
    }
}

pub(crate) fn validate_name(name: &str) -> Result<(), StoreError> {
    let mut chars = name.chars();
    if !chars.next().is_some_and(|c| c.is_ascii_lowercase()) {
        return Err(StoreError::Invalid(
            "category name must start with a lowercase ASCII letter".into(),
        ));
    }
    if name.len() < 2
        || chars.any(|c| c != '-' && !c.is_ascii_lowercase() && !c.is_ascii_digit())
    {
        return Err(StoreError::Invalid(
            "category names are lowercase alphanumerics and hyphens, two characters minimum"
                .into(),
        ));
    }
    Ok(())
}

/// The fields a user is allowed to change on a category.
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct CategoryEdit {
    pub name: Option<String>,
    pub title: Option<String>,
    pub hidden_nav: Option<bool>,
    pub hidden_main: Option<bool>,
    #[serde(default)]
    pub disabled: bool,
}

/// Applies a user edit. Disabling wins over every other field and renames
/// the category to its id in the same update; categories cannot be
/// re-enabled through the API (manual restoration is possible).
pub fn apply_edit(edit: CategoryEdit) -> impl FnOnce(&Category) -> Result<EntityUpdate, StoreError>
{
    move |category| {
        if let Some(name) = &edit.name {
            validate_name(name)?;
        }
        if edit.title.as_deref().is_some_and(str::is_empty) {
            return Err(StoreError::Invalid("category title cannot be empty".into()));
        }
        if !edit.disabled && category.disabled {
            return Err(StoreError::Invalid("categories cannot be re-enabled".into()));
        }

        let mut next = category.clone();
        if edit.disabled {
            next.disabled = true;
            next.name = category.id().to_string();
            return Ok(next.update());
        }

        if let Some(name) = edit.name {
            next.name = name;
        }
        if let Some(title) = edit.title {
            next.title = title;
        }
        if let Some(hidden_nav) = edit.hidden_nav {
            next.hidden_nav = hidden_nav;
        }
        if let Some(hidden_main) = edit.hidden_main {
            next.hidden_main = hidden_main;
        }

        if next.name == category.name
            && next.title == category.title
            && next.hidden_nav == category.hidden_nav
            && next.hidden_main == category.hidden_main
        {
            return Ok(EntityUpdate::noop(Category::TABLE));
        }
        Ok(next.update())
    }
}

/// Pins a category to a slot in the user's ordering. No-op when already
/// there.
pub fn set_sort_position(position: i64) -> impl Fn(&Category) -> EntityUpdate {
    move |category| {
        if category.sort_position == Some(position) {
            return EntityUpdate::noop(Category::TABLE);
        }
        let mut next = category.clone();
        next.sort_position = Some(position);
        next.update()
    }
}

impl Debug for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[Category {}: {} ({})", self.id, self.name, self.title)?;
        if self.disabled {
            f.write_str(", disabled")?;
        } else if self.hidden_nav {
            f.write_str(", hidden_nav")?;
        } else if self.hidden_main {
            f.write_str(", hidden_main")?;
        }
        f.write_str("]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn category(name: &str) -> Category {
        Category {
            id: 7,
            disabled: false,
            name: name.to_owned(),
            title: "News".to_owned(),
            hidden_nav: false,
            hidden_main: false,
            sort_position: None,
            commit_timestamp: SqlTime::now(),
        }
    }

    #[test]
    fn name_validation() {
        assert!(validate_name("news").is_ok());
        assert!(validate_name("a-1").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("a").is_err());
        assert!(validate_name("News").is_err());
        assert!(validate_name("1news").is_err());
        assert!(validate_name("with space").is_err());
    }

    #[test]
    fn disable_renames_to_id() {
        let update = apply_edit(CategoryEdit { disabled: true, ..CategoryEdit::default() })(
            &category("news"),
        )
        .unwrap();
        assert!(!update.is_noop());
    }

    #[test]
    fn reenable_is_rejected() {
        let mut cat = category("7");
        cat.disabled = true;
        let result = apply_edit(CategoryEdit::default())(&cat);
        assert!(result.is_err());
    }

    #[test]
    fn empty_edit_is_noop() {
        let update = apply_edit(CategoryEdit::default())(&category("news")).unwrap();
        assert!(update.is_noop());
    }

    #[test]
    fn sort_position_noop_when_unchanged() {
        let mut cat = category("news");
        cat.sort_position = Some(3);
        assert!(set_sort_position(3)(&cat).is_noop());
        assert!(!set_sort_position(4)(&cat).is_noop());
    }
}
