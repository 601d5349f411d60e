use comms::{AggregationError, ParameterSet};

/// A model that exposes its named parameters to the communicator.
pub trait LocalModel {
    /// A copy of the current parameters.
    fn parameters(&self) -> ParameterSet;

    /// Replaces the current parameters.
    ///
    /// # Returns
    /// `SchemaMismatch` if `params` isn't laid out like the current parameters.
    fn load_parameters(&mut self, params: &ParameterSet) -> Result<(), AggregationError>;
}

impl LocalModel for ParameterSet {
    fn parameters(&self) -> ParameterSet {
        self.clone()
    }

    fn load_parameters(&mut self, params: &ParameterSet) -> Result<(), AggregationError> {
        self.check_schema(params)?;
        self.clone_from(params);
        Ok(())
    }
}
