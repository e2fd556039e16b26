//! Catalog domain models as fetched from the upstream point-of-sale.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Catalog entity kinds tracked by mappings, deltas and deletions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Product,
    Category,
    Modifier,
    ModifierOption,
}

impl EntityType {
    pub const ALL: [EntityType; 4] = [
        EntityType::Category,
        EntityType::Modifier,
        EntityType::ModifierOption,
        EntityType::Product,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Product => "product",
            Self::Category => "category",
            Self::Modifier => "modifier",
            Self::ModifierOption => "modifier_option",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "product" => Some(Self::Product),
            "category" => Some(Self::Category),
            "modifier" => Some(Self::Modifier),
            "modifier_option" => Some(Self::ModifierOption),
            _ => None,
        }
    }

    /// Entity type a child mapping links to, if any.
    pub fn parent_type(&self) -> Option<EntityType> {
        match self {
            Self::ModifierOption => Some(Self::Modifier),
            Self::Product => Some(Self::Category),
            Self::Category | Self::Modifier => None,
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub price: Decimal,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub modifier_ids: Vec<String>,
    /// Menu groups this product is offered in. Empty means every group.
    #[serde(default)]
    pub menu_group_ids: Vec<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub is_deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub sort_order: i32,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub is_deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Modifier {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub min_selection: u32,
    #[serde(default)]
    pub max_selection: Option<u32>,
    #[serde(default)]
    pub options: Vec<ModifierOption>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub is_deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifierOption {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub price: Decimal,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub is_deleted: bool,
}

fn default_true() -> bool {
    true
}

/// Full catalog for one scope as returned by the catalog source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Catalog {
    #[serde(default)]
    pub products: Vec<Product>,
    #[serde(default)]
    pub categories: Vec<Category>,
    #[serde(default)]
    pub modifiers: Vec<Modifier>,
}

/// Entity counts persisted with each snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogCounts {
    pub products: i64,
    pub categories: i64,
    pub modifiers: i64,
    pub modifier_options: i64,
}

impl Catalog {
    pub fn is_empty(&self) -> bool {
        self.products.is_empty() && self.categories.is_empty() && self.modifiers.is_empty()
    }

    pub fn counts(&self) -> CatalogCounts {
        CatalogCounts {
            products: self.products.len() as i64,
            categories: self.categories.len() as i64,
            modifiers: self.modifiers.len() as i64,
            modifier_options: self
                .modifiers
                .iter()
                .map(|m| m.options.len() as i64)
                .sum(),
        }
    }

    /// Restricts the catalog to the products offered in `menu_group_id`.
    ///
    /// Categories and modifiers are kept as-is; only products carry the
    /// group assignment.
    pub fn filter_for_menu_group(&self, menu_group_id: &str) -> Catalog {
        Catalog {
            products: self
                .products
                .iter()
                .filter(|p| {
                    p.menu_group_ids.is_empty()
                        || p.menu_group_ids.iter().any(|g| g == menu_group_id)
                })
                .cloned()
                .collect(),
            categories: self.categories.clone(),
            modifiers: self.modifiers.clone(),
        }
    }

    pub fn product(&self, id: &str) -> Option<&Product> {
        self.products.iter().find(|p| p.id == id)
    }

    pub fn category(&self, id: &str) -> Option<&Category> {
        self.categories.iter().find(|c| c.id == id)
    }

    pub fn modifier(&self, id: &str) -> Option<&Modifier> {
        self.modifiers.iter().find(|m| m.id == id)
    }
}

/// A single catalog entity with its data, used by deltas and deletion audits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum CatalogEntity {
    Product(Product),
    Category(Category),
    Modifier(Modifier),
    ModifierOption {
        modifier_id: String,
        option: ModifierOption,
    },
}

impl CatalogEntity {
    pub fn entity_type(&self) -> EntityType {
        match self {
            Self::Product(_) => EntityType::Product,
            Self::Category(_) => EntityType::Category,
            Self::Modifier(_) => EntityType::Modifier,
            Self::ModifierOption { .. } => EntityType::ModifierOption,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Product(p) => &p.id,
            Self::Category(c) => &c.id,
            Self::Modifier(m) => &m.id,
            Self::ModifierOption { option, .. } => &option.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Product(p) => &p.name,
            Self::Category(c) => &c.name,
            Self::Modifier(m) => &m.name,
            Self::ModifierOption { option, .. } => &option.name,
        }
    }

    pub fn is_active(&self) -> bool {
        match self {
            Self::Product(p) => p.is_active,
            Self::Category(c) => c.is_active,
            Self::Modifier(m) => m.is_active,
            Self::ModifierOption { option, .. } => option.is_active,
        }
    }

    pub fn is_deleted(&self) -> bool {
        match self {
            Self::Product(p) => p.is_deleted,
            Self::Category(c) => c.is_deleted,
            Self::Modifier(m) => m.is_deleted,
            Self::ModifierOption { option, .. } => option.is_deleted,
        }
    }

    /// Live means present downstream: active and not flagged deleted.
    pub fn is_live(&self) -> bool {
        self.is_active() && !self.is_deleted()
    }

    /// Source id of the parent entity (option -> modifier, product -> category).
    pub fn parent_source_id(&self) -> Option<&str> {
        match self {
            Self::Product(p) => p.category_id.as_deref(),
            Self::ModifierOption { modifier_id, .. } => Some(modifier_id),
            Self::Category(_) | Self::Modifier(_) => None,
        }
    }
}
