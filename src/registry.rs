//! Field type registry and view descriptors
//!
//! Classification is global: a column name maps to one field kind no matter
//! which view references it. Views then restrict which columns may be
//! filtered and selected. The registry is built once at startup and shared
//! read-only afterwards.

use std::collections::{BTreeSet, HashMap};

use crate::error::{Error, Result};

/// Marker keys that bind against a view's configured date column
pub const START_DATE: &str = "start_date";
pub const END_DATE: &str = "end_date";

/// Which end of the date range a marker bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateBound {
    Start,
    End,
}

/// Filter semantics of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Numeric,
    Boolean,
    Date,
    Geometry,
    /// `start_date` / `end_date`: not a real column
    DateRange(DateBound),
}

/// One whitelisted, queryable view
#[derive(Debug, Clone)]
pub struct ViewDescriptor {
    pub name: &'static str,
    pub allowed_filter_columns: BTreeSet<&'static str>,
    pub selectable_columns: Vec<&'static str>,
    pub date_column: Option<&'static str>,
    pub geometry_column: Option<&'static str>,
    pub is_async: bool,
}

impl ViewDescriptor {
    pub fn returns_geometry(&self) -> bool {
        self.geometry_column.is_some()
    }

    pub fn can_filter(&self, column: &str) -> bool {
        self.allowed_filter_columns.contains(column)
    }

    pub fn can_select(&self, column: &str) -> bool {
        self.selectable_columns.iter().any(|c| *c == column)
    }
}

#[derive(Debug, Clone)]
pub struct Registry {
    kinds: HashMap<&'static str, FieldKind>,
    views: HashMap<&'static str, ViewDescriptor>,
}

impl Registry {
    /// Build and validate a registry.
    ///
    /// Every allow-listed filter column must be classified, a date column must
    /// be date-kind, and a geometry column must be selectable.
    pub fn new(
        kinds: impl IntoIterator<Item = (&'static str, FieldKind)>,
        views: impl IntoIterator<Item = ViewDescriptor>,
    ) -> Result<Self> {
        let kinds: HashMap<_, _> = kinds.into_iter().collect();
        let mut by_name = HashMap::new();

        for view in views {
            for column in &view.allowed_filter_columns {
                if !kinds.contains_key(column) {
                    return Err(Error::Config(format!(
                        "view '{}' allows filtering on unclassified column '{}'",
                        view.name, column
                    )));
                }
            }
            if let Some(date) = view.date_column {
                if kinds.get(date) != Some(&FieldKind::Date) {
                    return Err(Error::Config(format!(
                        "date column '{}' of view '{}' is not a date field",
                        date, view.name
                    )));
                }
            }
            if let Some(geom) = view.geometry_column {
                if !view.can_select(geom) || kinds.get(geom) != Some(&FieldKind::Geometry) {
                    return Err(Error::Config(format!(
                        "geometry column '{}' of view '{}' must be a selectable geometry field",
                        geom, view.name
                    )));
                }
            }
            if by_name.insert(view.name, view.clone()).is_some() {
                return Err(Error::Config(format!("view '{}' registered twice", view.name)));
            }
        }

        Ok(Self { kinds, views: by_name })
    }

    /// The views and classifications served in production
    pub fn builtin() -> Result<Self> {
        let kinds = STRING_FIELDS
            .iter()
            .map(|c| (*c, FieldKind::String))
            .chain(NUMERIC_FIELDS.iter().map(|c| (*c, FieldKind::Numeric)))
            .chain(BOOLEAN_FIELDS.iter().map(|c| (*c, FieldKind::Boolean)))
            .chain(DATE_FIELDS.iter().map(|c| (*c, FieldKind::Date)))
            .chain([
                ("geom", FieldKind::Geometry),
                (START_DATE, FieldKind::DateRange(DateBound::Start)),
                (END_DATE, FieldKind::DateRange(DateBound::End)),
            ]);

        let views = [
            ViewDescriptor {
                name: "plot_pixels_mv",
                allowed_filter_columns: [
                    "plot_name",
                    "campaign_name",
                    "sensor_name",
                    "granule_id",
                    "granule_date",
                    "geom",
                ]
                .into_iter()
                .collect(),
                selectable_columns: vec![
                    "plot_id",
                    "plot_name",
                    "campaign_name",
                    "sensor_name",
                    "granule_id",
                    "granule_date",
                    "geom",
                ],
                date_column: Some("granule_date"),
                geometry_column: Some("geom"),
                is_async: false,
            },
            ViewDescriptor {
                name: "insitu_sample_trait_mv",
                allowed_filter_columns: INSITU_COLUMNS.iter().copied().collect(),
                selectable_columns: INSITU_COLUMNS.to_vec(),
                date_column: Some("collection_date"),
                geometry_column: Some("geom"),
                is_async: false,
            },
            ViewDescriptor {
                name: "pixel_spectra_mv",
                allowed_filter_columns: ["plot_name", "granule_id", "granule_date", "pixel_id"]
                    .into_iter()
                    .collect(),
                selectable_columns: vec![
                    "plot_name",
                    "granule_id",
                    "granule_date",
                    "pixel_id",
                    "radiance",
                ],
                date_column: Some("granule_date"),
                geometry_column: None,
                is_async: true,
            },
        ];

        Self::new(kinds, views)
    }

    pub fn view(&self, name: &str) -> Result<&ViewDescriptor> {
        self.views
            .get(name)
            .ok_or_else(|| Error::UnknownView(name.to_string()))
    }

    pub fn kind_of(&self, column: &str) -> Option<FieldKind> {
        self.kinds.get(column).copied()
    }

    pub fn view_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.views.keys().copied()
    }
}

const STRING_FIELDS: &[&str] = &[
    "plot_name",
    "campaign_name",
    "sensor_name",
    "granule_id",
    "site_id",
    "sample_name",
    "trait",
    "units",
    "method",
    "handling",
    "error_type",
    "taxa",
    "veg_or_cover_type",
    "phenophase",
    "sample_fc_class",
    "plant_status",
    "plot_veg_type",
    "subplot_cover_method",
    // stored as free text ("yes"/"no", survey names), filtered by equality
    "floristic_survey",
    "plot_method",
];

const NUMERIC_FIELDS: &[&str] = &["value", "error", "sample_fc_percent", "pixel_id", "plot_id"];

const BOOLEAN_FIELDS: &[&str] = &[];

const DATE_FIELDS: &[&str] = &["granule_date", "collection_date"];

const INSITU_COLUMNS: &[&str] = &[
    "campaign_name",
    "site_id",
    "plot_name",
    "sample_name",
    "collection_date",
    "trait",
    "value",
    "units",
    "method",
    "handling",
    "error",
    "error_type",
    "taxa",
    "veg_or_cover_type",
    "phenophase",
    "sample_fc_class",
    "sample_fc_percent",
    "plant_status",
    "plot_veg_type",
    "subplot_cover_method",
    "floristic_survey",
    "plot_method",
    "geom",
];
