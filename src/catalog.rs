//! Lazy enumeration of candidate requests.
//!
//! A dataset's parameter lists are walked as an odometer: the last dimension in
//! the order turns fastest. Nothing is materialised up front, so very large
//! parameter spaces cost one index vector per (dataset, group) scope.

use std::fmt;

use crate::config::{ConfigurationGroup, DatasetSpec, TimePeriod};

/// One axis of a dataset's parameter space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    Variable,
    MipTable,
    Member,
    Grid,
    Version,
    TimePeriod,
}

/// Enumeration order for template resolution.
pub const TEMPLATE_ORDER: &[Dimension] = &[
    Dimension::Variable,
    Dimension::MipTable,
    Dimension::Member,
    Dimension::Grid,
    Dimension::Version,
    Dimension::TimePeriod,
];

/// Enumeration order for search resolution. The search service expands the
/// remaining facets itself.
pub const SEARCH_ORDER: &[Dimension] = &[Dimension::Variable, Dimension::Member];

/// One concrete combination of dataset parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateRequest {
    pub dataset: String,
    pub model: String,
    pub experiment: String,
    pub group: Option<String>,
    pub variable: String,
    pub mip_table: Option<String>,
    pub member: Option<String>,
    pub grid: Option<String>,
    pub version: Option<String>,
    pub time_period: Option<TimePeriod>,
}

impl fmt::Display for CandidateRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.dataset, self.model, self.experiment, self.variable)?;
        for part in [&self.mip_table, &self.member, &self.grid, &self.version]
            .into_iter()
            .flatten()
        {
            write!(f, "/{part}")?;
        }
        if let Some(period) = &self.time_period {
            write!(f, "/{}", period.period_string())?;
        }
        Ok(())
    }
}

/// Enumerates every candidate of every dataset in `order`.
pub fn enumerate<'a>(datasets: &'a [DatasetSpec], order: &'a [Dimension]) -> Candidates<'a> {
    Candidates {
        datasets,
        order,
        dataset_idx: 0,
        group_idx: 0,
        current: None,
    }
}

/// Iterator returned by [`enumerate`].
pub struct Candidates<'a> {
    datasets: &'a [DatasetSpec],
    order: &'a [Dimension],
    dataset_idx: usize,
    group_idx: usize,
    current: Option<Odometer<'a>>,
}

impl<'a> Candidates<'a> {
    fn next_scope(&mut self) -> Option<Odometer<'a>> {
        while let Some(dataset) = self.datasets.get(self.dataset_idx) {
            if dataset.configuration_groups.is_empty() {
                if self.group_idx == 0 {
                    self.group_idx = 1;
                    return Some(Odometer::new(dataset, None, self.order));
                }
            } else if let Some(group) = dataset.configuration_groups.get(self.group_idx) {
                self.group_idx += 1;
                return Some(Odometer::new(dataset, Some(group), self.order));
            }
            self.dataset_idx += 1;
            self.group_idx = 0;
        }
        None
    }
}

impl Iterator for Candidates<'_> {
    type Item = CandidateRequest;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(odometer) = self.current.as_mut() {
                if let Some(candidate) = odometer.next() {
                    return Some(candidate);
                }
                self.current = None;
            }
            self.current = Some(self.next_scope()?);
        }
    }
}

#[derive(Clone, Copy)]
enum Axis<'a> {
    Strings(&'a [String]),
    Periods(&'a [TimePeriod]),
}

impl Axis<'_> {
    fn len(&self) -> usize {
        match self {
            Axis::Strings(values) => values.len(),
            Axis::Periods(values) => values.len(),
        }
    }
}

struct Odometer<'a> {
    dataset: &'a DatasetSpec,
    group: Option<&'a ConfigurationGroup>,
    axes: Vec<(Dimension, Axis<'a>)>,
    indices: Vec<usize>,
    exhausted: bool,
}

impl<'a> Odometer<'a> {
    fn new(dataset: &'a DatasetSpec, group: Option<&'a ConfigurationGroup>, order: &[Dimension]) -> Self {
        let axes: Vec<(Dimension, Axis<'a>)> = order
            .iter()
            .filter_map(|dim| axis_for(dataset, group, *dim).map(|axis| (*dim, axis)))
            .collect();
        let exhausted = axes.iter().any(|(_, axis)| axis.len() == 0);
        Self {
            dataset,
            group,
            indices: vec![0; axes.len()],
            axes,
            exhausted,
        }
    }

    fn current(&self) -> CandidateRequest {
        let mut candidate = CandidateRequest {
            dataset: self.dataset.name.clone(),
            model: self.dataset.model.clone(),
            experiment: self.dataset.experiment.clone(),
            group: self.group.map(|g| g.name.clone()),
            variable: String::new(),
            mip_table: None,
            member: None,
            grid: None,
            version: None,
            time_period: None,
        };
        for ((dim, axis), idx) in self.axes.iter().zip(&self.indices) {
            match (dim, axis) {
                (Dimension::TimePeriod, Axis::Periods(values)) => {
                    candidate.time_period = Some(values[*idx].clone());
                }
                (dim, Axis::Strings(values)) => {
                    let value = values[*idx].clone();
                    match dim {
                        Dimension::Variable => candidate.variable = value,
                        Dimension::MipTable => candidate.mip_table = Some(value),
                        Dimension::Member => candidate.member = Some(value),
                        Dimension::Grid => candidate.grid = Some(value),
                        Dimension::Version => candidate.version = Some(value),
                        Dimension::TimePeriod => {}
                    }
                }
                _ => {}
            }
        }
        candidate
    }

    fn advance(&mut self) {
        for i in (0..self.indices.len()).rev() {
            self.indices[i] += 1;
            if self.indices[i] < self.axes[i].1.len() {
                return;
            }
            self.indices[i] = 0;
        }
        self.exhausted = true;
    }
}

impl Iterator for Odometer<'_> {
    type Item = CandidateRequest;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        let candidate = self.current();
        self.advance();
        Some(candidate)
    }
}

/// Values of `dim` for a scope. `None` drops the dimension from the product.
fn axis_for<'a>(
    dataset: &'a DatasetSpec,
    group: Option<&'a ConfigurationGroup>,
    dim: Dimension,
) -> Option<Axis<'a>> {
    let axis = match dim {
        Dimension::Variable => Axis::Strings(match group {
            Some(g) => &g.variables,
            None => &dataset.variables_to_download,
        }),
        Dimension::MipTable => Axis::Strings(
            group
                .and_then(|g| g.mip_tables.as_deref())
                .unwrap_or(&dataset.mip_tables_to_try),
        ),
        Dimension::Member => Axis::Strings(&dataset.ensemble_members),
        Dimension::Grid => Axis::Strings(&dataset.grids_to_try),
        Dimension::Version => Axis::Strings(dataset.versions.as_deref()?),
        Dimension::TimePeriod => Axis::Periods(
            group
                .and_then(|g| g.time_periods.as_deref())
                .unwrap_or(&dataset.time_periods),
        ),
    };
    Some(axis)
}
