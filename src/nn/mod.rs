//! Layers with hand-written backward passes, losses and optimizers

mod activations;
mod attention;
mod conv;
mod dense;
mod loss;
mod optim;
mod param;
mod pooling;
mod rnn;
mod schedule;

pub use activations::{argmax_last, softmax, Dropout, Relu};
pub use attention::{AttentionGrads, DotAttention};
pub use conv::{Conv2d, Padding};
pub use dense::Dense;
pub use loss::{categorical_accuracy, softmax_cross_entropy, LossOutput};
pub use optim::{Adam, Optimizer, OptimizerKind, Sgd};
pub use param::{Param, Parameterized};
pub use pooling::{MaxPool2d, Upsample2d};
pub use rnn::{Rnn, RnnGrads};
pub use schedule::LrSchedule;
